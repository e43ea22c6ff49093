use std::collections::BTreeMap;
use tempfile::tempdir;
use wardbus::config::Settings;
use wardbus::runtime::{next_dispatch_batch, ScopeScheduler};
use wardbus::shared::ids::{ScopeId, WorkItemId};
use wardbus::work::budget::{Budget, BudgetUsed};
use wardbus::work::item::{ItemType, OnStuck, WorkItem, WorkItemStatus, WorkItemStore};

fn pending_item(id: &str, scope: &str, resources: Vec<String>) -> WorkItem {
    WorkItem {
        work_item_id: WorkItemId::parse(id).expect("id"),
        scope_id: ScopeId::parse(scope).expect("scope"),
        item_type: ItemType::Task,
        budget: Budget {
            max_tokens: 1000,
            max_cost_usd: 1.0,
            max_wall_time_seconds: 60,
            max_attempts: 2,
            max_planner_calls: 1,
        },
        briefing: format!("work for {id}"),
        skills: Vec::new(),
        gates: Vec::new(),
        escalation: BTreeMap::new(),
        verification_checks: Vec::new(),
        schedule: None,
        on_stuck: OnStuck::Retry,
        resources,
        parent: None,
        depends_on: Vec::new(),
        tasks: Vec::new(),
        follow_up_of: None,
        status: WorkItemStatus::Pending,
        attempts: 0,
        budget_used: BudgetUsed::zero(),
        verification_results: Vec::new(),
        artifacts: Vec::new(),
        approval_token_id: None,
        replan_depth: 0,
        updated_at: 0,
    }
}

#[test]
fn dispatch_honors_global_and_per_scope_caps() {
    let tmp = tempdir().expect("tempdir");
    let items = WorkItemStore::open(&tmp.path().join("wardbus.db")).expect("store");

    for index in 0..4 {
        items
            .insert(&pending_item(&format!("a-{index}"), "tenant-a", Vec::new()))
            .expect("insert");
    }
    items
        .insert(&pending_item("b-0", "tenant-b", Vec::new()))
        .expect("insert");

    let settings = Settings {
        max_concurrent_items: 3,
        max_concurrent_per_scope: 2,
        ..Settings::default()
    };
    let scopes = vec![
        ScopeId::parse("tenant-a").expect("scope"),
        ScopeId::parse("tenant-b").expect("scope"),
    ];

    let mut scheduler = ScopeScheduler::new(settings.max_concurrent_per_scope);
    let batch =
        next_dispatch_batch(&items, &scopes, &settings, &mut scheduler).expect("dispatch");

    assert_eq!(batch.len(), 3, "global cap bounds the batch");
    let from_a = batch
        .iter()
        .filter(|item| item.scope_id == "tenant-a")
        .count();
    assert_eq!(from_a, 2, "per-scope cap bounds tenant-a");
    assert_eq!(batch.iter().filter(|item| item.scope_id == "tenant-b").count(), 1);
}

#[test]
fn dependency_edges_hold_items_back() {
    let tmp = tempdir().expect("tempdir");
    let items = WorkItemStore::open(&tmp.path().join("wardbus.db")).expect("store");

    let first = pending_item("first", "tenant-a", Vec::new());
    let mut second = pending_item("second", "tenant-a", Vec::new());
    second.depends_on = vec![first.work_item_id.clone()];
    items.insert(&first).expect("insert");
    items.insert(&second).expect("insert");

    let settings = Settings::default();
    let scopes = vec![ScopeId::parse("tenant-a").expect("scope")];
    let mut scheduler = ScopeScheduler::new(settings.max_concurrent_per_scope);

    let batch =
        next_dispatch_batch(&items, &scopes, &settings, &mut scheduler).expect("dispatch");
    let ids: Vec<&str> = batch
        .iter()
        .map(|item| item.value.work_item_id.as_str())
        .collect();
    assert_eq!(ids, vec!["first"], "blocked dependents stay out of the batch");
}

#[test]
fn shared_resources_serialize_sibling_items() {
    let tmp = tempdir().expect("tempdir");
    let items = WorkItemStore::open(&tmp.path().join("wardbus.db")).expect("store");

    items
        .insert(&pending_item(
            "writer-1",
            "tenant-a",
            vec!["docs/summary.md".to_string()],
        ))
        .expect("insert");
    items
        .insert(&pending_item(
            "writer-2",
            "tenant-a",
            vec!["docs/summary.md".to_string()],
        ))
        .expect("insert");

    let settings = Settings::default();
    let scopes = vec![ScopeId::parse("tenant-a").expect("scope")];
    let mut scheduler = ScopeScheduler::new(settings.max_concurrent_per_scope);

    let batch =
        next_dispatch_batch(&items, &scopes, &settings, &mut scheduler).expect("dispatch");
    assert_eq!(
        batch.len(),
        1,
        "items touching the same mutable resource never run together"
    );
}
