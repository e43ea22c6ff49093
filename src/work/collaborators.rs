use super::budget::BudgetUsed;
use super::item::{Artifact, GateSpec, GateTrigger, VerificationCheck, VerificationResult, WorkItem};

/// One entry of the attempt's tool-call ledger, kept for audit and for the
/// failure context handed to the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub tool: String,
    pub args: String,
    pub outcome: String,
}

#[derive(Debug)]
pub struct AttemptRequest<'a> {
    pub work_item: &'a WorkItem,
    pub attempt_number: u32,
    /// Planner guidance accumulated across earlier consults, oldest first.
    pub guidance: &'a [String],
    /// Artifacts hydrated from a `follow_up_of` predecessor.
    pub prior_artifacts: &'a [Artifact],
    /// Isolated fork of the scope's shared workspace. File changes land here
    /// and are reconciled back after verification passes.
    pub workspace: &'a std::path::Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub output: String,
    pub tool_ledger: Vec<ToolCall>,
    pub artifacts: Vec<Artifact>,
    /// Tokens, cost and wall time the attempt consumed. Charged against the
    /// work item's own budget.
    pub usage: BudgetUsed,
}

/// The executor agent. A failed run returns `Err` with a human-readable
/// reason; the lifecycle treats that as a retryable tool failure.
pub trait AttemptRunner {
    fn run(&self, request: &AttemptRequest<'_>) -> Result<AttemptReport, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    Continue,
    Block { reason: String },
    RequireApproval { reason: String },
}

#[derive(Debug)]
pub struct GateContext<'a> {
    pub work_item: &'a WorkItem,
    pub attempt_number: u32,
    /// Attempt output, present for post-attempt triggers.
    pub output: Option<&'a str>,
}

/// Gate content providers (policy scripts, quality checks) live behind this
/// one narrow interface; only the action contract matters here.
pub trait GateEvaluator {
    fn evaluate(
        &self,
        gates: &[GateSpec],
        trigger: GateTrigger,
        context: &GateContext<'_>,
    ) -> GateAction;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub all_passed: bool,
    pub results: Vec<VerificationResult>,
}

/// Deterministic verification executed outside the attempt's own
/// environment, against produced artifacts only — never against claims the
/// attempt makes about itself.
pub trait VerificationRunner {
    fn run_checks(
        &self,
        checks: &[VerificationCheck],
        artifacts: &[Artifact],
    ) -> VerificationReport;
}
