pub mod queue_worker;
pub mod recovery;
pub mod scheduler;
pub mod state_paths;
pub mod worker_primitives;

pub use crate::shared::errors::RuntimeError;
pub use queue_worker::{run_consumer_loop, ConsumerLoopConfig, MessageConsumer};
pub use recovery::recover_leased_messages;
pub use scheduler::{next_dispatch_batch, ScheduledItem, ScopeScheduler};
pub use state_paths::{
    bootstrap_state_root, default_state_root_path, StatePaths, DATABASE_FILE_NAME,
    DEFAULT_STATE_ROOT_DIR, SETTINGS_FILE_NAME,
};
pub use worker_primitives::{sleep_with_stop, WorkerEvent};
