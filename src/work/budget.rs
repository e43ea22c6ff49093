use serde::{Deserialize, Serialize};

/// Resource ceilings for one work item. Part of the immutable, approval-bound
/// projection: changing any ceiling changes the plan hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub max_wall_time_seconds: u64,
    pub max_attempts: u32,
    pub max_planner_calls: u32,
}

/// Consumed counters. Exhaustion is `>=` on every counter: reaching a ceiling
/// exactly counts as exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsed {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub wall_time_seconds: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub planner_calls: u32,
}

impl BudgetUsed {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn exceeds(&self, budget: &Budget) -> bool {
        self.exhausted_counter(budget).is_some()
    }

    /// Name of the first exhausted counter, for error detail.
    pub fn exhausted_counter(&self, budget: &Budget) -> Option<&'static str> {
        if self.tokens >= budget.max_tokens {
            return Some("max_tokens");
        }
        if self.cost_usd >= budget.max_cost_usd {
            return Some("max_cost_usd");
        }
        if self.wall_time_seconds >= budget.max_wall_time_seconds {
            return Some("max_wall_time_seconds");
        }
        if self.attempts >= budget.max_attempts {
            return Some("max_attempts");
        }
        if self.planner_calls >= budget.max_planner_calls {
            return Some("max_planner_calls");
        }
        None
    }

    /// Aggregates a descendant's consumption into this tracker. Every counter
    /// is summed, attempts and planner calls included, so parent items
    /// reflect total descendant consumption.
    pub fn merge(&mut self, child: &BudgetUsed) {
        self.tokens = self.tokens.saturating_add(child.tokens);
        self.cost_usd += child.cost_usd;
        self.wall_time_seconds = self.wall_time_seconds.saturating_add(child.wall_time_seconds);
        self.attempts = self.attempts.saturating_add(child.attempts);
        self.planner_calls = self.planner_calls.saturating_add(child.planner_calls);
    }
}
