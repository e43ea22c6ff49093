pub mod budget;
pub mod collaborators;
pub mod item;
pub mod lifecycle;
pub mod workspace;

pub use budget::{Budget, BudgetUsed};
pub use collaborators::{
    AttemptReport, AttemptRequest, AttemptRunner, GateAction, GateContext, GateEvaluator,
    ToolCall, VerificationReport, VerificationRunner,
};
pub use item::{
    Artifact, GateSpec, GateTrigger, InsertOutcome, ItemType, OnStuck, VerificationCheck,
    VerificationResult, WorkItem, WorkItemStatus, WorkItemStore,
};
pub use lifecycle::{execute, ExecutionContext, ExecutionOutcome};
pub use workspace::{prepare_attempt_workspace, reconcile, scope_workspace_dirs, MergeOutcome};

use crate::approval::ApprovalError;
use crate::queue::QueueError;
use item::WorkItemStatus as Status;

#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create work database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to encode work item `{work_item_id}`: {source}")]
    Encode {
        work_item_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode work item `{work_item_id}`: {source}")]
    Decode {
        work_item_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("work item `{work_item_id}` not found")]
    UnknownItem { work_item_id: String },
    #[error("work item `{work_item_id}` status transition `{from}` -> `{to}` is invalid")]
    InvalidTransition {
        work_item_id: String,
        from: Status,
        to: Status,
    },
    #[error("work item `{work_item_id}` has no approval token attached")]
    MissingApprovalToken { work_item_id: String },
    #[error("replan payload for `{work_item_id}` is not a work item: {reason}")]
    InvalidReplanPayload {
        work_item_id: String,
        reason: String,
    },
    #[error("workspace io error at {path}: {source}")]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("message construction failed: {0}")]
    Message(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
}
