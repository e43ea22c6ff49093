use crate::queue::{QueueError, QueueStore};
use crate::shared::logging::append_runtime_log_line;
use std::path::Path;

/// Startup recovery: every entry still marked `leased` belongs to a consumer
/// that no longer exists. All of them go back to `queued` before the first
/// poll; consumers re-process from durable state under the idempotency
/// ledger.
pub fn recover_leased_messages(
    store: &QueueStore,
    state_root: &Path,
    now: i64,
) -> Result<u32, QueueError> {
    let recovered = store.recover_leased(now)?;
    if recovered > 0 {
        append_runtime_log_line(
            state_root,
            "info",
            "queue.recovered",
            &format!("requeued {recovered} leased entries"),
        );
    }
    Ok(recovered)
}
