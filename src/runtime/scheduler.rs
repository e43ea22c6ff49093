use crate::config::Settings;
use crate::shared::ids::ScopeId;
use crate::work::item::{WorkItem, WorkItemStore};
use crate::work::WorkError;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug)]
pub struct ScheduledItem<T> {
    pub scope_id: String,
    pub resources: Vec<String>,
    pub value: T,
}

/// Dispatch gate for ready work items. Independent items run in parallel
/// under a per-scope cap (the global cap is the `max_items` argument to
/// `dequeue_runnable`); items declaring overlapping mutable resources are
/// serialized regardless of the dependency graph.
#[derive(Debug)]
pub struct ScopeScheduler<T> {
    pending: VecDeque<ScheduledItem<T>>,
    active_per_scope: HashMap<String, usize>,
    active_resources: HashSet<String>,
    max_per_scope: usize,
}

impl<T> ScopeScheduler<T> {
    pub fn new(max_per_scope: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active_per_scope: HashMap::new(),
            active_resources: HashSet::new(),
            max_per_scope: max_per_scope.max(1),
        }
    }

    pub fn enqueue(&mut self, scope_id: String, resources: Vec<String>, value: T) {
        self.pending.push_back(ScheduledItem {
            scope_id,
            resources,
            value,
        });
    }

    pub fn dequeue_runnable(&mut self, max_items: usize) -> Vec<ScheduledItem<T>> {
        if max_items == 0 || self.pending.is_empty() {
            return Vec::new();
        }

        let mut selected = Vec::new();
        let mut remaining = VecDeque::new();

        while let Some(item) = self.pending.pop_front() {
            let scope_active = self
                .active_per_scope
                .get(&item.scope_id)
                .copied()
                .unwrap_or(0);
            let resource_busy = item
                .resources
                .iter()
                .any(|resource| self.active_resources.contains(resource));

            if selected.len() < max_items
                && scope_active < self.max_per_scope
                && !resource_busy
            {
                *self.active_per_scope.entry(item.scope_id.clone()).or_insert(0) += 1;
                for resource in &item.resources {
                    self.active_resources.insert(resource.clone());
                }
                selected.push(item);
            } else {
                remaining.push_back(item);
            }
        }

        self.pending = remaining;
        selected
    }

    pub fn complete(&mut self, scope_id: &str, resources: &[String]) {
        if let Some(active) = self.active_per_scope.get_mut(scope_id) {
            *active = active.saturating_sub(1);
            if *active == 0 {
                self.active_per_scope.remove(scope_id);
            }
        }
        for resource in resources {
            self.active_resources.remove(resource);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active_per_scope.values().sum()
    }

    pub fn drain_pending(&mut self) -> Vec<ScheduledItem<T>> {
        self.pending.drain(..).collect()
    }
}

/// One dispatch round: pulls every ready item (pending, dependencies done)
/// for the given scopes and selects a batch under the global and per-scope
/// caps plus resource exclusivity. The caller executes the batch — marking
/// each item running and calling `complete` as it finishes — before asking
/// for the next round.
pub fn next_dispatch_batch(
    items: &WorkItemStore,
    scopes: &[ScopeId],
    settings: &Settings,
    scheduler: &mut ScopeScheduler<WorkItem>,
) -> Result<Vec<ScheduledItem<WorkItem>>, WorkError> {
    for scope in scopes {
        for item in items.ready_items(scope)? {
            scheduler.enqueue(item.scope_id.to_string(), item.resources.clone(), item);
        }
    }
    Ok(scheduler.dequeue_runnable(settings.max_concurrent_items))
}
