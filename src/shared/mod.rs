pub mod errors;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use errors::RuntimeError;
pub use fs_atomic::atomic_write_file;
pub use ids::{generate_id, ScopeId, WorkItemId};
pub use logging::{append_runtime_log_line, append_security_log_line};
pub use time::now_secs;
