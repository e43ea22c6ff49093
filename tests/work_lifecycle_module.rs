use std::collections::BTreeMap;
use std::sync::Mutex;
use tempfile::tempdir;
use wardbus::audit::{rows_for_event, AuditEvent};
use wardbus::approval::{ApprovalEngine, ApprovalScope, Ed25519Signer, Verdict};
use wardbus::config::Settings;
use wardbus::queue::{
    AgentRole, ErrorCode, MessageKind, MessagePayload, QueueMessage, QueueStore, ReportedStatus,
    Taint, EXECUTOR_INBOX, PLANNER_INBOX, STATUS_EVENTS,
};
use wardbus::shared::ids::{ScopeId, WorkItemId};
use wardbus::work::budget::{Budget, BudgetUsed};
use wardbus::work::collaborators::{
    AttemptReport, AttemptRequest, AttemptRunner, GateAction, GateContext, GateEvaluator,
    VerificationRunner,
};
use wardbus::work::item::{
    Artifact, GateSpec, GateTrigger, ItemType, OnStuck, VerificationCheck, VerificationResult,
    WorkItem, WorkItemStatus, WorkItemStore,
};
use wardbus::work::lifecycle::{execute, ExecutionContext, ExecutionOutcome};

struct Harness {
    _tmp: tempfile::TempDir,
    state_root: std::path::PathBuf,
    settings: Settings,
    queue: QueueStore,
    items: WorkItemStore,
    approval: ApprovalEngine,
    planner_budget: Budget,
}

fn harness() -> Harness {
    let tmp = tempdir().expect("tempdir");
    let state_root = tmp.path().to_path_buf();
    let db_path = state_root.join("wardbus.db");
    let settings = Settings {
        consult_timeout_seconds: 0,
        replan_timeout_seconds: 0,
        min_poll_ms: 10,
        ..Settings::default()
    };
    let signer = Ed25519Signer::from_seed([3_u8; 32]);
    let verifying_key = signer.verifying_key();
    Harness {
        queue: QueueStore::open(&db_path, settings.max_delivery_attempts).expect("queue"),
        items: WorkItemStore::open(&db_path).expect("items"),
        approval: ApprovalEngine::open(
            &state_root,
            &db_path,
            Box::new(signer),
            verifying_key,
            3600,
        )
        .expect("approval"),
        planner_budget: Budget {
            max_tokens: 1_000_000,
            max_cost_usd: 100.0,
            max_wall_time_seconds: 100_000,
            max_attempts: 100,
            max_planner_calls: 10,
        },
        settings,
        state_root,
        _tmp: tmp,
    }
}

fn sample_item(id: &str, max_attempts: u32, on_stuck: OnStuck) -> WorkItem {
    WorkItem {
        work_item_id: WorkItemId::parse(id).expect("id"),
        scope_id: ScopeId::parse("tenant-1").expect("scope"),
        item_type: ItemType::Task,
        budget: Budget {
            max_tokens: 100_000,
            max_cost_usd: 50.0,
            max_wall_time_seconds: 6_000,
            max_attempts,
            max_planner_calls: 5,
        },
        briefing: "produce the release summary".to_string(),
        skills: vec!["summarize".to_string()],
        gates: Vec::new(),
        escalation: BTreeMap::from([(
            "verification_failed".to_string(),
            "oncall-runtime".to_string(),
        )]),
        verification_checks: vec![VerificationCheck {
            name: "summary-present".to_string(),
            expectation: "artifact `summary` is non-empty".to_string(),
        }],
        schedule: None,
        on_stuck,
        resources: Vec::new(),
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

/// Issues and consumes an approval so the entry gate passes, then persists
/// the item with the token attached.
fn approve_and_insert(harness: &Harness, item: &mut WorkItem) {
    let token = harness
        .approval
        .issue(item, Verdict::Approved, ApprovalScope::Single, 5, None, 100)
        .expect("issue");
    harness
        .approval
        .verify(&token.token_id, item, None, 110)
        .expect("verify");
    item.approval_token_id = Some(token.token_id);
    harness.items.insert(item).expect("insert");
}

#[derive(Default)]
struct ScriptedRunner {
    /// Outcome per attempt, in order; missing entries fail the attempt.
    outcomes: Mutex<Vec<Result<AttemptReport, String>>>,
    seen_guidance: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    fn passing(attempts: usize) -> Self {
        let runner = Self::default();
        {
            let mut outcomes = runner.outcomes.lock().expect("lock");
            for _ in 0..attempts {
                outcomes.push(Ok(sample_report()));
            }
        }
        runner
    }

    fn calls(&self) -> usize {
        self.seen_guidance.lock().expect("lock").len()
    }
}

fn sample_report() -> AttemptReport {
    AttemptReport {
        output: "summary written".to_string(),
        tool_ledger: Vec::new(),
        artifacts: vec![Artifact {
            name: "summary".to_string(),
            content: "release went fine".to_string(),
        }],
        usage: BudgetUsed {
            tokens: 250,
            cost_usd: 0.1,
            wall_time_seconds: 12,
            attempts: 0,
            planner_calls: 0,
        },
    }
}

impl AttemptRunner for ScriptedRunner {
    fn run(&self, request: &AttemptRequest<'_>) -> Result<AttemptReport, String> {
        self.seen_guidance
            .lock()
            .expect("lock")
            .push(request.guidance.to_vec());
        let mut outcomes = self.outcomes.lock().expect("lock");
        if outcomes.is_empty() {
            Ok(sample_report())
        } else {
            outcomes.remove(0)
        }
    }
}

struct AllowAllGates;

impl GateEvaluator for AllowAllGates {
    fn evaluate(
        &self,
        _gates: &[GateSpec],
        _trigger: GateTrigger,
        _context: &GateContext<'_>,
    ) -> GateAction {
        GateAction::Continue
    }
}

struct BlockingGates {
    action: GateAction,
}

impl GateEvaluator for BlockingGates {
    fn evaluate(
        &self,
        _gates: &[GateSpec],
        trigger: GateTrigger,
        _context: &GateContext<'_>,
    ) -> GateAction {
        if trigger == GateTrigger::PreAttempt {
            self.action.clone()
        } else {
            GateAction::Continue
        }
    }
}

/// Verdict per verification round, in order; missing entries fail.
struct ScriptedVerifier {
    verdicts: Mutex<Vec<bool>>,
}

impl ScriptedVerifier {
    fn new(verdicts: Vec<bool>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts),
        }
    }

    fn always(pass: bool) -> Self {
        Self::new(vec![pass; 64])
    }
}

impl VerificationRunner for ScriptedVerifier {
    fn run_checks(
        &self,
        checks: &[VerificationCheck],
        _artifacts: &[Artifact],
    ) -> wardbus::work::collaborators::VerificationReport {
        let mut verdicts = self.verdicts.lock().expect("lock");
        let passed = if verdicts.is_empty() {
            false
        } else {
            verdicts.remove(0)
        };
        wardbus::work::collaborators::VerificationReport {
            all_passed: passed,
            results: checks
                .iter()
                .map(|check| VerificationResult {
                    check: check.name.clone(),
                    passed,
                    detail: None,
                })
                .collect(),
        }
    }
}

fn context<'a>(
    harness: &'a Harness,
    runner: &'a dyn AttemptRunner,
    gates: &'a dyn GateEvaluator,
    verifier: &'a dyn VerificationRunner,
) -> ExecutionContext<'a> {
    ExecutionContext {
        settings: &harness.settings,
        queue: &harness.queue,
        items: &harness.items,
        approval: &harness.approval,
        runner,
        gates,
        verifier,
        planner_budget: &harness.planner_budget,
        state_root: harness.state_root.clone(),
    }
}

fn drain_queue(queue: &QueueStore, name: &str) -> Vec<QueueMessage> {
    let mut messages = Vec::new();
    while let Some(leased) = queue
        .lease(name, "test-drain", 60, 1_000_000)
        .expect("lease")
    {
        queue
            .ack(name, &leased.message.message_id, 1_000_001)
            .expect("ack");
        messages.push(leased.message);
    }
    messages
}

#[test]
fn passing_verification_completes_the_item() {
    let harness = harness();
    let mut item = sample_item("item-done", 3, OnStuck::Retry);
    approve_and_insert(&harness, &mut item);

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            status: WorkItemStatus::Done
        }
    );

    let stored = harness.items.load(&item.work_item_id).expect("load");
    assert_eq!(stored.status, WorkItemStatus::Done);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.budget_used.tokens, 250);
    assert_eq!(stored.budget_used.attempts, 1);
    assert_eq!(planner_usage.planner_calls, 0);

    let events = drain_queue(&harness.queue, STATUS_EVENTS);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_kind, MessageKind::ExecutionStatus);
    assert_eq!(events[0].trace_id, "trace-1");
    assert!(matches!(
        events[0].payload,
        MessagePayload::Status {
            status: ReportedStatus::Done,
            ..
        }
    ));
}

#[test]
fn missing_token_blocks_before_any_attempt() {
    let harness = harness();
    let item = sample_item("item-unapproved", 3, OnStuck::Retry);
    harness.items.insert(&item).expect("insert");

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert!(matches!(outcome, ExecutionOutcome::Blocked { .. }));
    assert_eq!(runner.calls(), 0, "no attempt work may start unapproved");

    let stored = harness.items.load(&item.work_item_id).expect("load");
    assert_eq!(stored.status, WorkItemStatus::Blocked);

    let events = drain_queue(&harness.queue, STATUS_EVENTS);
    assert_eq!(events.len(), 1);
    let error = events[0].error.as_ref().expect("error headers");
    assert_eq!(error.error_code, ErrorCode::ApprovalDenied);
    assert!(!error.retryable);
}

#[test]
fn unverified_token_fails_the_entry_gate() {
    let harness = harness();
    let mut item = sample_item("item-unverified", 3, OnStuck::Retry);
    let token = harness
        .approval
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 5, None, 100)
        .expect("issue");
    // verify() never ran: the decision point was skipped
    item.approval_token_id = Some(token.token_id);
    harness.items.insert(&item).expect("insert");

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert!(matches!(outcome, ExecutionOutcome::Blocked { .. }));
    assert_eq!(runner.calls(), 0);
}

#[test]
fn cascade_orders_consult_and_replan_before_terminal_stuck() {
    let harness = harness();
    let mut item = sample_item("item-cascade", 2, OnStuck::ConsultPlanner);
    approve_and_insert(&harness, &mut item);

    let runner = ScriptedRunner::passing(4);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(false);
    let ctx = context(&harness, &runner, &gates, &verifier);

    // consult and replan waits both time out: the planner never answers
    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Stuck);
    assert_eq!(runner.calls(), 2, "both budgeted attempts must run");

    // attempt 1 fail -> consult (timeout) -> attempt 2 fail -> replan_request;
    // the audit log's insertion order is the authority on the sequence
    let planner_messages = drain_queue(&harness.queue, PLANNER_INBOX);
    let kind_by_id: BTreeMap<&str, MessageKind> = planner_messages
        .iter()
        .map(|message| (message.message_id.as_str(), message.message_kind))
        .collect();
    let connection = harness.queue.connect().expect("connect");
    let enqueue_order: Vec<MessageKind> = rows_for_event(&connection, AuditEvent::Enqueue)
        .expect("audit rows")
        .iter()
        .filter_map(|row| kind_by_id.get(row.subject_id.as_str()).copied())
        .collect();
    assert_eq!(
        enqueue_order,
        vec![MessageKind::ConsultPlanner, MessageKind::ReplanRequest]
    );
    for message in &planner_messages {
        assert_eq!(message.trace_id, "trace-1");
        assert_eq!(
            message.task_id.as_deref(),
            Some(item.work_item_id.as_str())
        );
    }
    // consult carries the attempt number of the failed attempt
    let MessagePayload::Opaque { fields } = &planner_messages[0].payload else {
        panic!("consult payload must be opaque fields");
    };
    assert_eq!(fields.get("attemptNumber"), Some(&serde_json::json!(1)));

    let stored = harness.items.load(&item.work_item_id).expect("load");
    assert_eq!(stored.status, WorkItemStatus::Stuck);

    // consult and replan generation charged the planner, not the item
    assert_eq!(planner_usage.planner_calls, 2);
    assert_eq!(stored.budget_used.planner_calls, 0);

    let events = drain_queue(&harness.queue, STATUS_EVENTS);
    let last = events.last().expect("terminal status event");
    assert!(matches!(
        last.payload,
        MessagePayload::Status {
            status: ReportedStatus::Stuck,
            ..
        }
    ));
    let error = last.error.as_ref().expect("stuck carries error headers");
    assert_eq!(error.error_code, ErrorCode::VerificationFailed);
    assert_eq!(error.attempt_number, 2);
    assert!(last.content.contains("oncall-runtime"));
}

#[test]
fn planner_guidance_is_injected_into_the_next_attempt() {
    let harness = harness();
    let mut item = sample_item("item-consult", 3, OnStuck::ConsultPlanner);
    approve_and_insert(&harness, &mut item);

    // the planner's reply is already waiting on the executor inbox
    let mut guidance = QueueMessage::new(
        AgentRole::Planner,
        MessageKind::PlannerGuidance,
        ScopeId::parse("tenant-1").expect("scope"),
        Taint::Trusted,
        "try the condensed template",
    )
    .expect("message");
    guidance.task_id = Some(item.work_item_id.to_string());
    harness
        .queue
        .enqueue(EXECUTOR_INBOX, &guidance, 150)
        .expect("enqueue guidance");

    let runner = ScriptedRunner::passing(2);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::new(vec![false, true]);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            status: WorkItemStatus::Done
        }
    );

    let seen = runner.seen_guidance.lock().expect("lock");
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_empty());
    assert_eq!(seen[1], vec!["try the condensed template".to_string()]);
    assert_eq!(planner_usage.planner_calls, 1);
}

#[test]
fn replan_spawns_a_successor_that_reenters_approval() {
    let harness = harness();
    let mut item = sample_item("item-replan", 1, OnStuck::Retry);
    approve_and_insert(&harness, &mut item);

    // revised plan already waiting, addressed to the exhausted item
    let successor_item = sample_item("item-replan-v2", 2, OnStuck::Retry);
    let mut plan_result = QueueMessage::new(
        AgentRole::Planner,
        MessageKind::PlanResult,
        ScopeId::parse("tenant-1").expect("scope"),
        Taint::Trusted,
        "revised plan",
    )
    .expect("message");
    plan_result.parent_task_id = Some(item.work_item_id.to_string());
    let mut fields = serde_json::Map::new();
    fields.insert(
        "workItem".to_string(),
        serde_json::to_value(&successor_item).expect("encode"),
    );
    plan_result.payload = MessagePayload::Opaque { fields };
    harness
        .queue
        .enqueue(EXECUTOR_INBOX, &plan_result, 150)
        .expect("enqueue plan result");

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(false);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    let ExecutionOutcome::Replanned { successor } = outcome else {
        panic!("expected a re-planned successor");
    };
    assert_eq!(successor.as_str(), "item-replan-v2");

    let stored_successor = harness.items.load(&successor).expect("load successor");
    assert_eq!(stored_successor.status, WorkItemStatus::Pending);
    assert_eq!(stored_successor.replan_depth, 1);
    assert_eq!(
        stored_successor.follow_up_of.as_ref().map(|id| id.as_str()),
        Some("item-replan")
    );
    assert!(
        stored_successor.approval_token_id.is_none(),
        "successor re-enters the approval flow unapproved"
    );

    let old = harness.items.load(&item.work_item_id).expect("load old");
    assert_eq!(old.status, WorkItemStatus::Failed);
}

#[test]
fn replan_depth_cap_is_shared_across_the_chain() {
    let harness = harness();
    let mut item = sample_item("item-deep", 1, OnStuck::Retry);
    item.replan_depth = 2; // already at the default cap
    approve_and_insert(&harness, &mut item);

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(false);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert_eq!(outcome, ExecutionOutcome::Stuck);

    // no replan_request once the chain's depth budget is spent
    let planner_messages = drain_queue(&harness.queue, PLANNER_INBOX);
    assert!(planner_messages.is_empty());
}

#[test]
fn gate_block_marks_the_item_blocked() {
    let harness = harness();
    let mut item = sample_item("item-gated", 3, OnStuck::Retry);
    item.gates = vec![GateSpec {
        name: "deploy-freeze".to_string(),
        trigger: GateTrigger::PreAttempt,
    }];
    approve_and_insert(&harness, &mut item);

    let runner = ScriptedRunner::passing(1);
    let gates = BlockingGates {
        action: GateAction::Block {
            reason: "deploy freeze active".to_string(),
        },
    };
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert!(matches!(outcome, ExecutionOutcome::Blocked { .. }));
    assert_eq!(runner.calls(), 0);

    let events = drain_queue(&harness.queue, STATUS_EVENTS);
    let error = events[0].error.as_ref().expect("error headers");
    assert_eq!(error.error_code, ErrorCode::GateBlocked);

    let stored = harness.items.load(&item.work_item_id).expect("load");
    assert_eq!(stored.status, WorkItemStatus::Blocked);
}

#[test]
fn descendant_usage_rolls_up_to_the_parent() {
    let harness = harness();
    let parent = sample_item("project-1", 5, OnStuck::Retry);
    harness.items.insert(&parent).expect("insert parent");

    let mut child = sample_item("project-1-task", 3, OnStuck::Retry);
    child.parent = Some(parent.work_item_id.clone());
    approve_and_insert(&harness, &mut child);

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    execute(
        &ctx,
        &child.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");

    let rolled_up = harness.items.load(&parent.work_item_id).expect("load parent");
    assert_eq!(rolled_up.budget_used.tokens, 250);
    assert_eq!(rolled_up.budget_used.attempts, 1);
}

#[test]
fn scheduled_goals_settle_healthy_instead_of_done() {
    let harness = harness();
    let mut goal = sample_item("goal-digest", 3, OnStuck::Retry);
    goal.item_type = ItemType::Goal;
    goal.schedule = Some("daily".to_string());
    approve_and_insert(&harness, &mut goal);

    let runner = ScriptedRunner::passing(1);
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    let outcome = execute(
        &ctx,
        &goal.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            status: WorkItemStatus::Healthy
        }
    );

    // a healthy goal is not terminal; the scheduler may cycle it again
    let stored = harness.items.load(&goal.work_item_id).expect("load");
    assert!(!stored.status.is_terminal());
}

#[test]
fn follow_up_items_hydrate_predecessor_artifacts() {
    let harness = harness();
    let mut predecessor = sample_item("item-first", 1, OnStuck::Retry);
    predecessor.artifacts = vec![Artifact {
        name: "draft".to_string(),
        content: "first pass".to_string(),
    }];
    predecessor.status = WorkItemStatus::Done;
    harness.items.insert(&predecessor).expect("insert");

    let mut item = sample_item("item-second", 1, OnStuck::Retry);
    item.follow_up_of = Some(predecessor.work_item_id.clone());
    approve_and_insert(&harness, &mut item);

    struct HydrationProbe {
        seen: Mutex<Vec<Artifact>>,
    }
    impl AttemptRunner for HydrationProbe {
        fn run(&self, request: &AttemptRequest<'_>) -> Result<AttemptReport, String> {
            *self.seen.lock().expect("lock") = request.prior_artifacts.to_vec();
            Ok(sample_report())
        }
    }

    let runner = HydrationProbe {
        seen: Mutex::new(Vec::new()),
    };
    let gates = AllowAllGates;
    let verifier = ScriptedVerifier::always(true);
    let ctx = context(&harness, &runner, &gates, &verifier);

    let mut planner_usage = BudgetUsed::zero();
    execute(
        &ctx,
        &item.work_item_id,
        "trace-1",
        &mut planner_usage,
        200,
    )
    .expect("execute");

    let seen = runner.seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "draft");
}
