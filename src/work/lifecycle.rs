use super::budget::{Budget, BudgetUsed};
use super::collaborators::{
    AttemptRequest, AttemptRunner, GateAction, GateContext, GateEvaluator, VerificationRunner,
};
use super::item::{Artifact, GateTrigger, ItemType, OnStuck, WorkItem, WorkItemStatus, WorkItemStore};
use super::workspace::{prepare_attempt_workspace, reconcile, scope_workspace_dirs, MergeOutcome};
use super::WorkError;
use crate::approval::{ApprovalEngine, ApprovalError};
use crate::audit::{append_audit_row, AuditEvent};
use crate::config::Settings;
use crate::queue::{
    route, AgentRole, ErrorCode, ErrorHeaders, MessageKind, MessagePayload, QueueMessage,
    QueueStore, ReportedStatus, Taint, EXECUTOR_INBOX,
};
use crate::shared::ids::{generate_id, WorkItemId};
use crate::shared::logging::append_security_log_line;
use crate::shared::time::now_secs;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

pub struct ExecutionContext<'a> {
    pub settings: &'a Settings,
    pub queue: &'a QueueStore,
    pub items: &'a WorkItemStore,
    pub approval: &'a ApprovalEngine,
    pub runner: &'a dyn AttemptRunner,
    pub gates: &'a dyn GateEvaluator,
    pub verifier: &'a dyn VerificationRunner,
    /// Separate allocation for planner consultation and re-plan generation.
    /// A stuck item must never starve its own recovery budget.
    pub planner_budget: &'a Budget,
    pub state_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { status: WorkItemStatus },
    Blocked { reason: String },
    /// A revised plan was produced; the successor re-enters the approval
    /// flow as a fresh work item and restarts the lifecycle at the entry
    /// gate.
    Replanned { successor: WorkItemId },
    Stuck,
}

/// Drives one work item through the escalation cascade:
/// attempt → verify → consult → re-plan → escalate.
///
/// Redelivery after a crash restarts here from the durably persisted record
/// — attempt counters and spent budget resume, partial in-flight side
/// effects are never replayed.
pub fn execute(
    ctx: &ExecutionContext<'_>,
    work_item_id: &WorkItemId,
    trace_id: &str,
    planner_usage: &mut BudgetUsed,
    now: i64,
) -> Result<ExecutionOutcome, WorkError> {
    let mut item = ctx.items.load(work_item_id)?;

    // The single non-bypassable gate: no code path below may start attempt
    // work unless the non-consuming check passes.
    let Some(token_id) = item.approval_token_id.clone() else {
        return block_item(
            ctx,
            &mut item,
            trace_id,
            ErrorCode::ApprovalDenied,
            "no approval token attached",
            now,
        );
    };
    if let Err(err) = ctx.approval.check(&token_id, &item, now) {
        return match err {
            ApprovalError::Denied { reason, .. } => block_item(
                ctx,
                &mut item,
                trace_id,
                ErrorCode::ApprovalDenied,
                reason.as_str(),
                now,
            ),
            other => Err(other.into()),
        };
    }

    let prior_artifacts: Vec<Artifact> = match &item.follow_up_of {
        Some(predecessor) => ctx.items.load(predecessor)?.artifacts,
        None => Vec::new(),
    };

    let mut guidance: Vec<String> = Vec::new();
    let mut last_error: Option<ErrorHeaders> = None;

    loop {
        if let Some(counter) = item.budget_used.exhausted_counter(&item.budget) {
            if last_error.is_none() {
                last_error = Some(ErrorHeaders {
                    error_code: ErrorCode::BudgetExceeded,
                    retryable: false,
                    origin_agent: AgentRole::Executor,
                    attempt_number: item.attempts,
                });
            }
            append_security_log_line(
                &ctx.state_root,
                "budget_exhausted",
                &format!("work_item={} counter={counter}", item.work_item_id),
            );
            break;
        }

        ensure_running(ctx, &mut item)?;
        let attempt_number = item.attempts + 1;

        let pre_gate = ctx.gates.evaluate(
            &item.gates,
            GateTrigger::PreAttempt,
            &GateContext {
                work_item: &item,
                attempt_number,
                output: None,
            },
        );
        match pre_gate {
            GateAction::Continue => {}
            GateAction::Block { reason } => {
                return gate_block(ctx, &mut item, trace_id, &reason, false)
            }
            GateAction::RequireApproval { reason } => {
                return gate_block(ctx, &mut item, trace_id, &reason, true)
            }
        }

        // The counter is durable before the attempt runs, so a crash
        // mid-attempt still counts it on resume.
        item.attempts = attempt_number;
        item.budget_used.attempts += 1;
        item.updated_at = now_secs();
        ctx.items.persist(&item)?;

        let (shared_dir, attempts_root) =
            scope_workspace_dirs(&ctx.state_root, item.scope_id.as_str());
        std::fs::create_dir_all(&shared_dir).map_err(|source| WorkError::Workspace {
            path: shared_dir.display().to_string(),
            source,
        })?;
        let attempt_dir = prepare_attempt_workspace(
            &shared_dir,
            &attempts_root,
            item.work_item_id.as_str(),
            attempt_number,
        )
        .map_err(|source| WorkError::Workspace {
            path: attempts_root.display().to_string(),
            source,
        })?;

        let attempt_result = {
            let request = AttemptRequest {
                work_item: &item,
                attempt_number,
                guidance: &guidance,
                prior_artifacts: &prior_artifacts,
                workspace: &attempt_dir,
            };
            ctx.runner.run(&request)
        };

        match attempt_result {
            Ok(report) => {
                let mut usage = report.usage.clone();
                usage.attempts = 0;
                usage.planner_calls = 0;
                item.budget_used.merge(&usage);
                item.artifacts = report.artifacts.clone();
                item.updated_at = now_secs();
                ctx.items.persist(&item)?;

                let post_gate = ctx.gates.evaluate(
                    &item.gates,
                    GateTrigger::PostAttempt,
                    &GateContext {
                        work_item: &item,
                        attempt_number,
                        output: Some(&report.output),
                    },
                );
                match post_gate {
                    GateAction::Continue => {}
                    GateAction::Block { reason } => {
                        return gate_block(ctx, &mut item, trace_id, &reason, false)
                    }
                    GateAction::RequireApproval { reason } => {
                        return gate_block(ctx, &mut item, trace_id, &reason, true)
                    }
                }

                let verification = ctx
                    .verifier
                    .run_checks(&item.verification_checks, &report.artifacts);
                item.verification_results = verification.results.clone();
                item.updated_at = now_secs();
                ctx.items.persist(&item)?;

                if verification.all_passed {
                    // verified changes reconcile into the shared workspace;
                    // a conflict blocks rather than silently overwriting
                    let merge = reconcile(&shared_dir, &attempt_dir).map_err(|source| {
                        WorkError::Workspace {
                            path: attempt_dir.display().to_string(),
                            source,
                        }
                    })?;
                    if let MergeOutcome::Conflict { relative_path } = merge {
                        return block_item(
                            ctx,
                            &mut item,
                            trace_id,
                            ErrorCode::ToolFailure,
                            &format!("workspace merge conflict on `{relative_path}`"),
                            now_secs(),
                        );
                    }

                    let final_status =
                        if item.item_type == ItemType::Goal && item.schedule.is_some() {
                            WorkItemStatus::Healthy
                        } else {
                            WorkItemStatus::Done
                        };
                    ctx.items.transition_status(
                        &mut item,
                        final_status,
                        now_secs(),
                        "verification passed",
                    )?;
                    let reported = if final_status == WorkItemStatus::Healthy {
                        ReportedStatus::Healthy
                    } else {
                        ReportedStatus::Done
                    };
                    emit_status(ctx, &item, trace_id, reported, None, "verification passed")?;
                    roll_up_usage(ctx, &item)?;
                    return Ok(ExecutionOutcome::Completed {
                        status: final_status,
                    });
                }

                last_error = Some(ErrorHeaders {
                    error_code: ErrorCode::VerificationFailed,
                    retryable: true,
                    origin_agent: AgentRole::Executor,
                    attempt_number,
                });
            }
            Err(reason) => {
                last_error = Some(ErrorHeaders {
                    error_code: ErrorCode::ToolFailure,
                    retryable: true,
                    origin_agent: AgentRole::Executor,
                    attempt_number,
                });
                append_security_log_line(
                    &ctx.state_root,
                    "attempt_failed",
                    &format!("work_item={} attempt={attempt_number} {reason}", item.work_item_id),
                );
            }
        }

        // guidance exists to steer the next attempt; once the budget admits
        // no next attempt the cascade moves straight to re-plan
        if item.budget_used.exceeds(&item.budget) {
            break;
        }

        if item.on_stuck == OnStuck::ConsultPlanner {
            if planner_usage.exceeds(ctx.planner_budget) {
                // planner allocation is spent; remaining rungs fall through
                // to re-plan
            } else {
                planner_usage.planner_calls += 1;
                match consult_planner(ctx, &mut item, trace_id, last_error.as_ref(), attempt_number)?
                {
                    Some(text) => guidance.push(text),
                    None => {
                        last_error = Some(ErrorHeaders {
                            error_code: ErrorCode::Timeout,
                            retryable: true,
                            origin_agent: AgentRole::Planner,
                            attempt_number,
                        });
                    }
                }
            }
        }
    }

    escalate(ctx, &mut item, trace_id, &guidance, last_error, planner_usage)
}

fn ensure_running(ctx: &ExecutionContext<'_>, item: &mut WorkItem) -> Result<(), WorkError> {
    if item.status == WorkItemStatus::Running {
        return Ok(());
    }
    ctx.items
        .transition_status(item, WorkItemStatus::Running, now_secs(), "attempt starting")
}

/// Persisted suspension plus message-driven resumption: the wait is durable
/// state (`awaiting_planner_guidance`) and a bounded poll for the reply, so
/// a crash during the wait loses nothing.
fn consult_planner(
    ctx: &ExecutionContext<'_>,
    item: &mut WorkItem,
    trace_id: &str,
    last_error: Option<&ErrorHeaders>,
    attempt_number: u32,
) -> Result<Option<String>, WorkError> {
    ctx.items.transition_status(
        item,
        WorkItemStatus::AwaitingPlannerGuidance,
        now_secs(),
        "consulting planner",
    )?;

    let mut fields = Map::new();
    fields.insert("attemptNumber".to_string(), Value::from(attempt_number));
    fields.insert(
        "verificationResults".to_string(),
        serde_json::to_value(&item.verification_results)
            .map_err(|err| WorkError::Message(err.to_string()))?,
    );
    if let Some(error) = last_error {
        fields.insert(
            "error".to_string(),
            serde_json::to_value(error).map_err(|err| WorkError::Message(err.to_string()))?,
        );
    }

    let message = lifecycle_message(
        item,
        trace_id,
        MessageKind::ConsultPlanner,
        "execution stalled, requesting planner guidance",
        MessagePayload::Opaque { fields },
        last_error.cloned(),
    )?;
    ctx.queue.enqueue(
        route(AgentRole::Executor, MessageKind::ConsultPlanner),
        &message,
        now_secs(),
    )?;

    let reply = wait_for_reply(
        ctx,
        MessageKind::PlannerGuidance,
        item.work_item_id.as_str(),
        ctx.settings.consult_timeout_seconds,
    )?;
    Ok(reply.map(|message| guidance_text(&message)))
}

fn guidance_text(message: &QueueMessage) -> String {
    if let MessagePayload::Opaque { fields } = &message.payload {
        if let Some(Value::String(text)) = fields.get("guidance") {
            return text.clone();
        }
    }
    message.content.clone()
}

/// Attempts and consults are exhausted. One re-plan rung remains before the
/// cascade surfaces to a human.
fn escalate(
    ctx: &ExecutionContext<'_>,
    item: &mut WorkItem,
    trace_id: &str,
    guidance: &[String],
    last_error: Option<ErrorHeaders>,
    planner_usage: &mut BudgetUsed,
) -> Result<ExecutionOutcome, WorkError> {
    let error = last_error.unwrap_or(ErrorHeaders {
        error_code: ErrorCode::VerificationFailed,
        retryable: false,
        origin_agent: AgentRole::Executor,
        attempt_number: item.attempts,
    });

    let replan_available = item.replan_depth < ctx.settings.max_replan_depth
        && !planner_usage.exceeds(ctx.planner_budget);
    if !replan_available {
        return terminal_stuck(ctx, item, trace_id, &error, "re-plan budget exhausted");
    }

    planner_usage.planner_calls += 1;

    let mut fields = Map::new();
    fields.insert("attempts".to_string(), Value::from(item.attempts));
    fields.insert("replanDepth".to_string(), Value::from(item.replan_depth));
    fields.insert(
        "budgetUsed".to_string(),
        serde_json::to_value(&item.budget_used)
            .map_err(|err| WorkError::Message(err.to_string()))?,
    );
    fields.insert(
        "verificationResults".to_string(),
        serde_json::to_value(&item.verification_results)
            .map_err(|err| WorkError::Message(err.to_string()))?,
    );
    fields.insert(
        "guidanceHistory".to_string(),
        serde_json::to_value(guidance).map_err(|err| WorkError::Message(err.to_string()))?,
    );
    fields.insert(
        "error".to_string(),
        serde_json::to_value(&error).map_err(|err| WorkError::Message(err.to_string()))?,
    );

    let message = lifecycle_message(
        item,
        trace_id,
        MessageKind::ReplanRequest,
        "escalation cascade exhausted attempts, requesting revised plan",
        MessagePayload::Opaque { fields },
        Some(error.clone()),
    )?;
    ctx.queue.enqueue(
        route(AgentRole::Executor, MessageKind::ReplanRequest),
        &message,
        now_secs(),
    )?;

    let reply = wait_for_reply(
        ctx,
        MessageKind::PlanResult,
        item.work_item_id.as_str(),
        ctx.settings.replan_timeout_seconds,
    )?;
    let Some(reply) = reply else {
        return terminal_stuck(ctx, item, trace_id, &error, "re-plan wait timed out");
    };

    let Some(successor) = parse_replan_result(&reply) else {
        return terminal_stuck(
            ctx,
            item,
            trace_id,
            &error,
            "planner produced no viable alternative",
        );
    };

    let mut successor = successor;
    successor.status = WorkItemStatus::Pending;
    successor.attempts = 0;
    successor.budget_used = BudgetUsed::zero();
    successor.verification_results = Vec::new();
    successor.artifacts = Vec::new();
    successor.approval_token_id = None;
    // the whole re-plan chain shares one depth budget
    successor.replan_depth = item.replan_depth + 1;
    successor.follow_up_of = Some(item.work_item_id.clone());
    successor.scope_id = item.scope_id.clone();
    successor.updated_at = now_secs();
    ctx.items.insert(&successor)?;

    ctx.items.transition_status(
        item,
        WorkItemStatus::Failed,
        now_secs(),
        "superseded by re-plan",
    )?;
    emit_status(
        ctx,
        item,
        trace_id,
        ReportedStatus::Failed,
        Some(error),
        &format!("superseded by re-plan `{}`", successor.work_item_id),
    )?;
    roll_up_usage(ctx, item)?;
    Ok(ExecutionOutcome::Replanned {
        successor: successor.work_item_id,
    })
}

fn parse_replan_result(message: &QueueMessage) -> Option<WorkItem> {
    let MessagePayload::Opaque { fields } = &message.payload else {
        return None;
    };
    let raw = fields.get("workItem")?;
    serde_json::from_value(raw.clone()).ok()
}

/// The only point at which the system surfaces to a human, reached only
/// after every automated recovery rung has been exhausted.
fn terminal_stuck(
    ctx: &ExecutionContext<'_>,
    item: &mut WorkItem,
    trace_id: &str,
    error: &ErrorHeaders,
    reason: &str,
) -> Result<ExecutionOutcome, WorkError> {
    ctx.items
        .transition_status(item, WorkItemStatus::Stuck, now_secs(), reason)?;

    let escalation_target = item
        .escalation
        .get(error.error_code.as_str())
        .cloned()
        .unwrap_or_else(|| "operator".to_string());
    let connection = ctx.items.connect()?;
    append_audit_row(
        &connection,
        now_secs(),
        item.scope_id.as_str(),
        AuditEvent::Escalated,
        item.work_item_id.as_str(),
        &format!("target={escalation_target} reason={reason}"),
    )
    .map_err(|source| WorkError::Sql { source })?;

    emit_status(
        ctx,
        item,
        trace_id,
        ReportedStatus::Stuck,
        Some(error.clone()),
        &format!("{reason}; escalated to {escalation_target}"),
    )?;
    roll_up_usage(ctx, item)?;
    Ok(ExecutionOutcome::Stuck)
}

/// Parents reflect total descendant consumption, attempts included.
fn roll_up_usage(ctx: &ExecutionContext<'_>, item: &WorkItem) -> Result<(), WorkError> {
    let Some(parent_id) = &item.parent else {
        return Ok(());
    };
    let mut parent = match ctx.items.load(parent_id) {
        Ok(parent) => parent,
        Err(WorkError::UnknownItem { .. }) => return Ok(()),
        Err(other) => return Err(other),
    };
    parent.budget_used.merge(&item.budget_used);
    parent.updated_at = now_secs();
    ctx.items.persist(&parent)
}

fn block_item(
    ctx: &ExecutionContext<'_>,
    item: &mut WorkItem,
    trace_id: &str,
    error_code: ErrorCode,
    reason: &str,
    now: i64,
) -> Result<ExecutionOutcome, WorkError> {
    ctx.items
        .transition_status(item, WorkItemStatus::Blocked, now, reason)?;
    emit_status(
        ctx,
        item,
        trace_id,
        ReportedStatus::Blocked,
        Some(ErrorHeaders {
            error_code,
            retryable: false,
            origin_agent: AgentRole::Runtime,
            attempt_number: item.attempts,
        }),
        reason,
    )?;
    Ok(ExecutionOutcome::Blocked {
        reason: reason.to_string(),
    })
}

fn gate_block(
    ctx: &ExecutionContext<'_>,
    item: &mut WorkItem,
    trace_id: &str,
    reason: &str,
    approval_required: bool,
) -> Result<ExecutionOutcome, WorkError> {
    let detail = if approval_required {
        format!("approval required: {reason}")
    } else {
        format!("gate blocked: {reason}")
    };
    let connection = ctx.items.connect()?;
    append_audit_row(
        &connection,
        now_secs(),
        item.scope_id.as_str(),
        AuditEvent::GateBlocked,
        item.work_item_id.as_str(),
        &detail,
    )
    .map_err(|source| WorkError::Sql { source })?;
    append_security_log_line(
        &ctx.state_root,
        "gate_blocked",
        &format!("work_item={} {detail}", item.work_item_id),
    );

    ctx.items
        .transition_status(item, WorkItemStatus::Blocked, now_secs(), &detail)?;
    emit_status(
        ctx,
        item,
        trace_id,
        ReportedStatus::Blocked,
        Some(ErrorHeaders {
            error_code: ErrorCode::GateBlocked,
            retryable: false,
            origin_agent: AgentRole::Runtime,
            attempt_number: item.attempts,
        }),
        &detail,
    )?;
    Ok(ExecutionOutcome::Blocked { reason: detail })
}

fn emit_status(
    ctx: &ExecutionContext<'_>,
    item: &WorkItem,
    trace_id: &str,
    status: ReportedStatus,
    error: Option<ErrorHeaders>,
    detail: &str,
) -> Result<(), WorkError> {
    let message = lifecycle_message(
        item,
        trace_id,
        MessageKind::ExecutionStatus,
        detail,
        MessagePayload::Status {
            status,
            detail: Some(detail.to_string()),
        },
        error,
    )?;
    ctx.queue.enqueue(
        route(AgentRole::Executor, MessageKind::ExecutionStatus),
        &message,
        now_secs(),
    )?;
    Ok(())
}

fn lifecycle_message(
    item: &WorkItem,
    trace_id: &str,
    message_kind: MessageKind,
    content: &str,
    payload: MessagePayload,
    error: Option<ErrorHeaders>,
) -> Result<QueueMessage, WorkError> {
    Ok(QueueMessage {
        message_id: generate_id("msg").map_err(WorkError::Message)?,
        trace_id: trace_id.to_string(),
        content: content.to_string(),
        sender: AgentRole::Executor,
        message_kind,
        scope_id: item.scope_id.clone(),
        taint: Taint::Trusted,
        task_id: Some(item.work_item_id.to_string()),
        parent_task_id: item.parent.as_ref().map(|id| id.to_string()),
        work_item_id: Some(item.work_item_id.clone()),
        approval_token_id: item.approval_token_id.clone(),
        payload,
        error,
    })
}

/// Bounded poll for a reply addressed to this work item. Selective receive:
/// unrelated messages on the inbox are never leased, so waiting burns no
/// retry budget on them.
fn wait_for_reply(
    ctx: &ExecutionContext<'_>,
    kind: MessageKind,
    task_id: &str,
    timeout_seconds: i64,
) -> Result<Option<QueueMessage>, WorkError> {
    let owner = format!("lifecycle-{task_id}");
    let deadline = now_secs() + timeout_seconds;
    loop {
        let leased = ctx.queue.lease_reply(
            EXECUTOR_INBOX,
            &owner,
            kind.as_str(),
            task_id,
            ctx.settings.lease_duration_seconds,
            now_secs(),
        )?;
        if let Some(leased) = leased {
            ctx.queue
                .ack(EXECUTOR_INBOX, &leased.message.message_id, now_secs())?;
            return Ok(Some(leased.message));
        }
        if now_secs() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(ctx.settings.min_poll_ms));
    }
}
