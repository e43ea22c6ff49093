pub mod message;
pub mod routing;
pub mod store;

pub use message::{
    AgentRole, ErrorCode, ErrorHeaders, MessageKind, MessagePayload, QueueMessage, ReportedStatus,
    Taint,
};
pub use routing::{
    derive_message, route, ALL_QUEUES, EXECUTOR_INBOX, PLANNER_INBOX, ROUTER_INBOX, STATUS_EVENTS,
};
pub use store::{
    DeadLetterRecord, EnqueueOutcome, LeasedMessage, NackOutcome, QueueError, QueueStore,
};
