use crate::shared::ids::{generate_id, ScopeId, WorkItemId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    User,
    Router,
    Planner,
    Executor,
    Runtime,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentRole::User => "user",
            AgentRole::Router => "router",
            AgentRole::Planner => "planner",
            AgentRole::Executor => "executor",
            AgentRole::Runtime => "runtime",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UserMessage,
    PlanRequest,
    PlanResult,
    ResearchRequest,
    ResearchResult,
    ExecutionStatus,
    ConsultPlanner,
    PlannerGuidance,
    ReplanRequest,
    SystemEvent,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::UserMessage => "user_message",
            MessageKind::PlanRequest => "plan_request",
            MessageKind::PlanResult => "plan_result",
            MessageKind::ResearchRequest => "research_request",
            MessageKind::ResearchResult => "research_result",
            MessageKind::ExecutionStatus => "execution_status",
            MessageKind::ConsultPlanner => "consult_planner",
            MessageKind::PlannerGuidance => "planner_guidance",
            MessageKind::ReplanRequest => "replan_request",
            MessageKind::SystemEvent => "system_event",
        }
    }
}

/// Trust classification inherited from the originating input. Derived
/// messages never upgrade taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taint {
    Trusted,
    Untrusted,
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ToolFailure,
    BudgetExceeded,
    GateBlocked,
    ApprovalDenied,
    VerificationFailed,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ToolFailure => "tool_failure",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::GateBlocked => "gate_blocked",
            ErrorCode::ApprovalDenied => "approval_denied",
            ErrorCode::VerificationFailed => "verification_failed",
            ErrorCode::Timeout => "timeout",
        }
    }
}

/// Normalized error headers. Required on every message reporting a
/// non-success outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHeaders {
    pub error_code: ErrorCode,
    pub retryable: bool,
    pub origin_agent: AgentRole,
    pub attempt_number: u32,
}

/// Status values an `execution_status` message may report. A superset of the
/// work-item statuses: `verification_failed` is a reporting-only state that
/// never lands in the work-item table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Pending,
    Running,
    Healthy,
    Done,
    Failed,
    Stuck,
    Blocked,
    Paused,
    VerificationFailed,
}

impl ReportedStatus {
    pub fn requires_error_headers(self) -> bool {
        matches!(
            self,
            ReportedStatus::Failed
                | ReportedStatus::Stuck
                | ReportedStatus::Blocked
                | ReportedStatus::VerificationFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "payloadType")]
pub enum MessagePayload {
    Status {
        status: ReportedStatus,
        #[serde(default)]
        detail: Option<String>,
    },
    Error {
        reason: String,
    },
    Opaque {
        #[serde(default)]
        fields: Map<String, Value>,
    },
}

impl MessagePayload {
    pub fn empty() -> Self {
        MessagePayload::Opaque { fields: Map::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub trace_id: String,
    pub content: String,
    pub sender: AgentRole,
    pub message_kind: MessageKind,
    pub scope_id: ScopeId,
    pub taint: Taint,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub work_item_id: Option<WorkItemId>,
    #[serde(default)]
    pub approval_token_id: Option<String>,
    pub payload: MessagePayload,
    #[serde(default)]
    pub error: Option<ErrorHeaders>,
}

impl QueueMessage {
    /// New message with a fresh message id and its own trace id. Derived
    /// messages in an existing causal chain go through
    /// [`crate::queue::routing::derive_message`] instead.
    pub fn new(
        sender: AgentRole,
        message_kind: MessageKind,
        scope_id: ScopeId,
        taint: Taint,
        content: impl Into<String>,
    ) -> Result<Self, String> {
        Ok(Self {
            message_id: generate_id("msg")?,
            trace_id: generate_id("trace")?,
            content: content.into(),
            sender,
            message_kind,
            scope_id,
            taint,
            task_id: None,
            parent_task_id: None,
            work_item_id: None,
            approval_token_id: None,
            payload: MessagePayload::empty(),
            error: None,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.message_id.trim().is_empty() {
            return Err("message id must be non-empty".to_string());
        }
        if self.trace_id.trim().is_empty() {
            return Err("trace id must be non-empty".to_string());
        }
        match &self.payload {
            MessagePayload::Status { status, .. } => {
                if self.message_kind == MessageKind::ExecutionStatus
                    && status.requires_error_headers()
                    && self.error.is_none()
                {
                    return Err(format!(
                        "execution_status message `{}` reports a non-success status without \
                         error headers",
                        self.message_id
                    ));
                }
            }
            MessagePayload::Error { .. } => {
                if self.error.is_none() {
                    return Err(format!(
                        "error payload on message `{}` requires error headers",
                        self.message_id
                    ));
                }
            }
            MessagePayload::Opaque { .. } => {}
        }
        Ok(())
    }
}
