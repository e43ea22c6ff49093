use super::recovery::recover_leased_messages;
use super::worker_primitives::{sleep_with_stop, WorkerEvent};
use crate::approval::{NonceDomain, NonceStore, RecordOutcome};
use crate::config::Settings;
use crate::queue::{QueueMessage, QueueStore};
use crate::shared::logging::append_runtime_log_line;
use crate::shared::time::now_secs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One queue's consumer. Side effects must be idempotent-guarded by the
/// loop's ledger discipline, not by the handler; the handler just does the
/// work.
pub trait MessageConsumer {
    fn name(&self) -> &str;
    fn handle(&self, message: &QueueMessage) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct ConsumerLoopConfig {
    pub worker_id: String,
    pub queue_name: String,
    pub settings: Settings,
    pub state_root: PathBuf,
}

/// Polls `lease()` with exponential backoff, enforces the idempotency ledger
/// around every handler invocation, heartbeats long-running work below one
/// third of the lease duration, and acks/nacks by handler outcome. Horizontal
/// scaling is running more of these loops against the same queue.
pub fn run_consumer_loop(
    config: ConsumerLoopConfig,
    store: QueueStore,
    nonces: NonceStore,
    consumer: &dyn MessageConsumer,
    stop: Arc<AtomicBool>,
    events: Sender<WorkerEvent>,
) {
    let _ = events.send(WorkerEvent::Started {
        worker_id: config.worker_id.clone(),
        at: now_secs(),
    });

    if let Err(error) = recover_leased_messages(&store, &config.state_root, now_secs()) {
        let _ = events.send(WorkerEvent::Error {
            worker_id: config.worker_id.clone(),
            at: now_secs(),
            message: error.to_string(),
            fatal: false,
        });
    }
    // nonce records older than any token that could reference them are dead
    // weight; trim them on every worker boot
    if let Err(error) = nonces.prune(now_secs(), config.settings.nonce_retention_seconds()) {
        let _ = events.send(WorkerEvent::Error {
            worker_id: config.worker_id.clone(),
            at: now_secs(),
            message: error.to_string(),
            fatal: false,
        });
    }

    let mut backoff_ms = config.settings.min_poll_ms;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let leased = match store.lease(
            &config.queue_name,
            &config.worker_id,
            config.settings.lease_duration_seconds,
            now_secs(),
        ) {
            Ok(leased) => leased,
            Err(error) => {
                let _ = events.send(WorkerEvent::Error {
                    worker_id: config.worker_id.clone(),
                    at: now_secs(),
                    message: error.to_string(),
                    fatal: false,
                });
                if !sleep_with_stop(&stop, Duration::from_millis(config.settings.max_poll_ms)) {
                    break;
                }
                continue;
            }
        };

        let Some(leased) = leased else {
            let _ = events.send(WorkerEvent::Heartbeat {
                worker_id: config.worker_id.clone(),
                at: now_secs(),
            });
            if !sleep_with_stop(&stop, Duration::from_millis(backoff_ms)) {
                break;
            }
            backoff_ms = backoff_ms
                .saturating_mul(2)
                .min(config.settings.max_poll_ms);
            continue;
        };
        backoff_ms = config.settings.min_poll_ms;

        if let Err(error) = process_leased(&config, &store, &nonces, consumer, &leased.message) {
            let _ = events.send(WorkerEvent::Error {
                worker_id: config.worker_id.clone(),
                at: now_secs(),
                message: error,
                fatal: false,
            });
        } else {
            let _ = events.send(WorkerEvent::Heartbeat {
                worker_id: config.worker_id.clone(),
                at: now_secs(),
            });
        }
    }

    let _ = events.send(WorkerEvent::Stopped {
        worker_id: config.worker_id,
        at: now_secs(),
    });
}

fn process_leased(
    config: &ConsumerLoopConfig,
    store: &QueueStore,
    nonces: &NonceStore,
    consumer: &dyn MessageConsumer,
    message: &QueueMessage,
) -> Result<(), String> {
    let queue = &config.queue_name;
    let message_id = &message.message_id;

    // Redelivery of an already-completed message: the ledger says the side
    // effects happened, so the only remaining work is the ack.
    let already_done = store
        .has_processed(consumer.name(), message_id)
        .map_err(|e| e.to_string())?;
    if already_done {
        store
            .ack(queue, message_id, now_secs())
            .map_err(|e| e.to_string())?;
        append_runtime_log_line(
            &config.state_root,
            "info",
            "queue.dedup",
            &format!("consumer={} message={message_id} already processed", consumer.name()),
        );
        return Ok(());
    }

    let nonce_binding = format!("{queue}:{message_id}");
    let seen_before = nonces
        .record(NonceDomain::Msg, &nonce_binding, now_secs())
        .map_err(|e| e.to_string())?;
    if seen_before == RecordOutcome::AlreadyUsed {
        // at-least-once redelivery, not an attack; the ledger above is what
        // gates side effects
        append_runtime_log_line(
            &config.state_root,
            "info",
            "queue.redelivery",
            &format!("message={message_id}"),
        );
    }

    let handled = {
        let _heartbeat = HeartbeatGuard::start(
            store.clone(),
            queue.clone(),
            message_id.clone(),
            config.settings.lease_duration_seconds,
            config.settings.effective_heartbeat_seconds(),
        );
        consumer.handle(message)
    };

    match handled {
        Ok(()) => {
            store
                .mark_processed(consumer.name(), message_id, now_secs())
                .map_err(|e| e.to_string())?;
            store
                .ack(queue, message_id, now_secs())
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        Err(reason) => {
            store
                .nack(queue, message_id, now_secs())
                .map_err(|e| e.to_string())?;
            Err(format!(
                "consumer {} failed on message {message_id}: {reason}",
                consumer.name()
            ))
        }
    }
}

/// Extends the lease at the configured cadence while a handler runs; a
/// missed heartbeat past the lease expiry is treated as a consumer crash by
/// every other worker.
struct HeartbeatGuard {
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HeartbeatGuard {
    fn start(
        store: QueueStore,
        queue: String,
        message_id: String,
        lease_duration_seconds: i64,
        interval_seconds: i64,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let thread_done = done.clone();
        let handle = thread::spawn(move || {
            let interval = Duration::from_secs(interval_seconds.max(1) as u64);
            loop {
                if sleep_with_stop(&thread_done, interval) {
                    let beat = store.heartbeat(
                        &queue,
                        &message_id,
                        lease_duration_seconds,
                        now_secs(),
                    );
                    if beat.is_err() {
                        // lease already gone; nothing left to extend
                        break;
                    }
                } else {
                    break;
                }
            }
        });
        Self {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
