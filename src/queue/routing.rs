use super::message::{AgentRole, MessageKind, MessagePayload, QueueMessage};
use crate::shared::ids::generate_id;

pub const ROUTER_INBOX: &str = "router_inbox";
pub const PLANNER_INBOX: &str = "planner_inbox";
pub const EXECUTOR_INBOX: &str = "executor_inbox";
pub const STATUS_EVENTS: &str = "status_events";

pub const ALL_QUEUES: [&str; 4] = [ROUTER_INBOX, PLANNER_INBOX, EXECUTOR_INBOX, STATUS_EVENTS];

/// Deterministic routing table. Total over the whole `(sender, kind)` domain
/// and with no discretion: a `plan_result` always lands on the router inbox,
/// a `consult_planner` always lands on the planner inbox, regardless of who
/// produced them.
pub fn route(sender: AgentRole, kind: MessageKind) -> &'static str {
    let _ = sender;
    match kind {
        MessageKind::UserMessage => ROUTER_INBOX,
        MessageKind::PlanRequest => PLANNER_INBOX,
        MessageKind::PlanResult => ROUTER_INBOX,
        MessageKind::ResearchRequest => EXECUTOR_INBOX,
        MessageKind::ResearchResult => PLANNER_INBOX,
        MessageKind::ExecutionStatus => STATUS_EVENTS,
        MessageKind::ConsultPlanner => PLANNER_INBOX,
        MessageKind::PlannerGuidance => EXECUTOR_INBOX,
        MessageKind::ReplanRequest => PLANNER_INBOX,
        MessageKind::SystemEvent => STATUS_EVENTS,
    }
}

/// New message in an existing causal chain. `trace_id`, `scope_id` and
/// `taint` are copied unchanged from the parent so the chain can be
/// reconstructed end-to-end; derived messages never launder taint.
pub fn derive_message(
    parent: &QueueMessage,
    sender: AgentRole,
    message_kind: MessageKind,
    content: impl Into<String>,
) -> Result<QueueMessage, String> {
    Ok(QueueMessage {
        message_id: generate_id("msg")?,
        trace_id: parent.trace_id.clone(),
        content: content.into(),
        sender,
        message_kind,
        scope_id: parent.scope_id.clone(),
        taint: parent.taint,
        task_id: parent.task_id.clone(),
        parent_task_id: parent.parent_task_id.clone(),
        work_item_id: parent.work_item_id.clone(),
        approval_token_id: None,
        payload: MessagePayload::empty(),
        error: None,
    })
}
