use std::collections::BTreeMap;
use tempfile::tempdir;
use wardbus::approval::{
    ApprovalEngine, ApprovalError, ApprovalScope, DenialReason, Ed25519Signer, NonceDomain,
    Verdict,
};
use wardbus::shared::ids::{ScopeId, WorkItemId};
use wardbus::work::budget::{Budget, BudgetUsed};
use wardbus::work::item::{ItemType, OnStuck, WorkItem, WorkItemStatus};

fn sample_item(id: &str) -> WorkItem {
    WorkItem {
        work_item_id: WorkItemId::parse(id).expect("id"),
        scope_id: ScopeId::parse("tenant-1").expect("scope"),
        item_type: ItemType::Task,
        budget: Budget {
            max_tokens: 10_000,
            max_cost_usd: 5.0,
            max_wall_time_seconds: 600,
            max_attempts: 3,
            max_planner_calls: 2,
        },
        briefing: "compile the weekly report".to_string(),
        skills: vec!["search".to_string(), "summarize".to_string()],
        gates: Vec::new(),
        escalation: BTreeMap::new(),
        verification_checks: Vec::new(),
        schedule: None,
        on_stuck: OnStuck::ConsultPlanner,
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

fn open_engine(root: &std::path::Path) -> ApprovalEngine {
    let signer = Ed25519Signer::from_seed([7_u8; 32]);
    let verifying_key = signer.verifying_key();
    ApprovalEngine::open(
        root,
        &root.join("wardbus.db"),
        Box::new(signer),
        verifying_key,
        3600,
    )
    .expect("open engine")
}

#[test]
fn issue_verify_check_round_trip() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 2, None, 100)
        .expect("issue");
    assert_eq!(token.executions_used, 0);
    assert!(token.execution_nonces.is_empty());

    let verified = engine
        .verify(&token.token_id, &item, None, 200)
        .expect("verify");
    assert_eq!(verified.executions_used, 1);
    assert_eq!(verified.execution_nonces.len(), 1);

    let checked = engine.check(&token.token_id, &item, 300).expect("check");
    assert_eq!(checked.executions_used, 1);
}

#[test]
fn single_use_token_is_consumed_exactly_once() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 1, None, 100)
        .expect("issue");

    let exec_nonces_before = engine
        .nonce_store()
        .count(NonceDomain::Exec)
        .expect("count");
    assert_eq!(exec_nonces_before, 0);

    engine
        .verify(&token.token_id, &item, None, 200)
        .expect("first verify succeeds");
    assert_eq!(
        engine.nonce_store().count(NonceDomain::Exec).expect("count"),
        1
    );

    let second = engine
        .verify(&token.token_id, &item, None, 201)
        .expect_err("second verify must fail");
    assert_eq!(
        second.denial_reason(),
        Some(DenialReason::ExecutionsExhausted)
    );

    // check never consumes, no matter how often it runs
    for now in 300..310 {
        engine.check(&token.token_id, &item, now).expect("check");
    }
    assert_eq!(
        engine.nonce_store().count(NonceDomain::Exec).expect("count"),
        1
    );
}

#[test]
fn check_requires_a_prior_verify() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 1, None, 100)
        .expect("issue");
    let err = engine
        .check(&token.token_id, &item, 150)
        .expect_err("unverified token must not pass the entry gate");
    assert_eq!(err.denial_reason(), Some(DenialReason::NotYetVerified));
}

#[test]
fn expired_tokens_fail_both_verify_and_check() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 2, None, 100)
        .expect("issue");
    engine
        .verify(&token.token_id, &item, None, 200)
        .expect("verify inside ttl");

    // ttl is 3600 from issue
    let err = engine
        .verify(&token.token_id, &item, None, 3700)
        .expect_err("expired verify");
    assert_eq!(err.denial_reason(), Some(DenialReason::Expired));

    let err = engine
        .check(&token.token_id, &item, 3700)
        .expect_err("expired check");
    assert_eq!(err.denial_reason(), Some(DenialReason::Expired));
}

#[test]
fn plan_mutation_after_issue_fails_closed() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 1, None, 100)
        .expect("issue");

    let mut tampered = item.clone();
    tampered.briefing = "compile the weekly report and wire money".to_string();
    let err = engine
        .verify(&token.token_id, &tampered, None, 200)
        .expect_err("tampered plan");
    assert_eq!(err.denial_reason(), Some(DenialReason::PlanHashMismatch));

    // runtime-state changes do not disturb the binding
    let mut running = item.clone();
    running.status = WorkItemStatus::Running;
    running.attempts = 2;
    engine
        .verify(&token.token_id, &running, None, 210)
        .expect("runtime fields are outside the plan hash");
}

#[test]
fn forged_signature_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    let item = sample_item("item-1");

    // tokens signed by a different key than the engine trusts
    let rogue = Ed25519Signer::from_seed([9_u8; 32]);
    let trusted = Ed25519Signer::from_seed([7_u8; 32]);
    let engine = ApprovalEngine::open(
        tmp.path(),
        &tmp.path().join("wardbus.db"),
        Box::new(rogue),
        trusted.verifying_key(),
        3600,
    )
    .expect("open engine");

    let token = engine
        .issue(&item, Verdict::Approved, ApprovalScope::Single, 1, None, 100)
        .expect("issue");
    let err = engine
        .verify(&token.token_id, &item, None, 200)
        .expect_err("wrong key");
    assert_eq!(err.denial_reason(), Some(DenialReason::BadSignature));
}

#[test]
fn denied_verdict_never_authorizes() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let token = engine
        .issue(&item, Verdict::Denied, ApprovalScope::Single, 1, None, 100)
        .expect("issue records the decision");
    let err = engine
        .verify(&token.token_id, &item, None, 200)
        .expect_err("denied verdict");
    assert_eq!(err.denial_reason(), Some(DenialReason::NotApproved));
}

#[test]
fn standing_token_binds_spawned_tasks_to_parent_and_policy() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());

    let mut goal = sample_item("goal-1");
    goal.item_type = ItemType::Goal;
    goal.schedule = Some("hourly".to_string());

    let mut template = sample_item("template-1");
    template.parent = Some(goal.work_item_id.clone());

    let token = engine
        .issue(
            &goal,
            Verdict::Approved,
            ApprovalScope::Standing,
            10,
            Some(&template),
            100,
        )
        .expect("issue standing");
    assert!(token.spawn_policy_hash.is_some());

    let mut spawned = sample_item("spawn-1");
    spawned.parent = Some(goal.work_item_id.clone());
    engine
        .verify(&token.token_id, &goal, Some(&spawned), 200)
        .expect("conforming spawn verifies");

    // structurally valid signature and unexpired token, wrong parent
    let mut orphan = sample_item("spawn-2");
    orphan.parent = Some(WorkItemId::parse("goal-other").expect("id"));
    let err = engine
        .verify(&token.token_id, &goal, Some(&orphan), 201)
        .expect_err("foreign parent fails closed");
    assert_eq!(err.denial_reason(), Some(DenialReason::SpawnParentMismatch));

    // right parent, different capability class
    let mut rogue_class = sample_item("spawn-3");
    rogue_class.parent = Some(goal.work_item_id.clone());
    rogue_class.skills.push("payments".to_string());
    let err = engine
        .verify(&token.token_id, &goal, Some(&rogue_class), 202)
        .expect_err("policy drift fails closed");
    assert_eq!(err.denial_reason(), Some(DenialReason::SpawnPolicyMismatch));
}

#[test]
fn each_standing_verify_consumes_exactly_one_nonce() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());

    let mut goal = sample_item("goal-1");
    goal.item_type = ItemType::Goal;
    let mut template = sample_item("template-1");
    template.parent = Some(goal.work_item_id.clone());

    let token = engine
        .issue(
            &goal,
            Verdict::Approved,
            ApprovalScope::Standing,
            3,
            Some(&template),
            100,
        )
        .expect("issue standing");

    for run in 0..3 {
        let mut spawned = sample_item(&format!("spawn-{run}"));
        spawned.parent = Some(goal.work_item_id.clone());
        engine
            .verify(&token.token_id, &goal, Some(&spawned), 200 + run as i64)
            .expect("verify within cap");
        assert_eq!(
            engine.nonce_store().count(NonceDomain::Exec).expect("count"),
            run as u64 + 1
        );
    }

    let mut spawned = sample_item("spawn-late");
    spawned.parent = Some(goal.work_item_id.clone());
    let err = engine
        .verify(&token.token_id, &goal, Some(&spawned), 300)
        .expect_err("cap reached");
    assert_eq!(
        err.denial_reason(),
        Some(DenialReason::ExecutionsExhausted)
    );
}

#[test]
fn unknown_token_is_a_hard_denial() {
    let tmp = tempdir().expect("tempdir");
    let engine = open_engine(tmp.path());
    let item = sample_item("item-1");

    let err = engine
        .verify("token-never-issued", &item, None, 100)
        .expect_err("unknown token");
    assert!(matches!(
        err,
        ApprovalError::Denied {
            reason: DenialReason::UnknownToken,
            ..
        }
    ));
}
