use super::message::QueueMessage;
use crate::audit::{append_audit_row, ensure_audit_schema, AuditEvent};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create queue database parent {path}: {source}")]
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
    #[error("invalid message payload for `{message_id}`: {source}")]
    Payload {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message validation failed: {0}")]
    InvalidMessage(String),
    #[error("unknown message `{message_id}` in queue `{queue}`")]
    UnknownMessage { queue: String, message_id: String },
    #[error("lease not held for message `{message_id}`")]
    LeaseNotHeld { message_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { retry_count: u32 },
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub queue: String,
    pub message: QueueMessage,
    pub retry_count: u32,
    pub lease_owner: String,
    pub lease_expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub queue: String,
    pub message: QueueMessage,
    pub reason: String,
    pub retry_count: u32,
    pub dead_lettered_at: i64,
}

/// Lease-based durable queue over SQLite. Delivery is at-least-once: an entry
/// leaves the table only through `ack` or the dead-letter archive. Effect
/// dedup is the consumer's job via the idempotency ledger
/// (`has_processed`/`mark_processed`).
#[derive(Debug, Clone)]
pub struct QueueStore {
    db_path: PathBuf,
    max_delivery_attempts: u32,
}

impl QueueStore {
    pub fn open(db_path: &Path, max_delivery_attempts: u32) -> Result<Self, QueueError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| QueueError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
            max_delivery_attempts,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<(), QueueError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS queue_entries (
                    queue TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    trace_id TEXT NOT NULL,
                    scope_id TEXT NOT NULL,
                    message_kind TEXT NOT NULL,
                    task_id TEXT,
                    parent_task_id TEXT,
                    state TEXT NOT NULL,
                    lease_owner TEXT,
                    lease_expires_at INTEGER,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    enqueued_at INTEGER NOT NULL,
                    message TEXT NOT NULL,
                    PRIMARY KEY (queue, message_id)
                );

                CREATE INDEX IF NOT EXISTS idx_queue_entries_claimable
                    ON queue_entries(queue, state, enqueued_at);

                CREATE TABLE IF NOT EXISTS dead_letters (
                    queue TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    retry_count INTEGER NOT NULL,
                    dead_lettered_at INTEGER NOT NULL,
                    message TEXT NOT NULL,
                    PRIMARY KEY (queue, message_id)
                );

                CREATE TABLE IF NOT EXISTS processed_messages (
                    consumer TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    processed_at INTEGER NOT NULL,
                    PRIMARY KEY (consumer, message_id)
                );
                ",
            )
            .map_err(|source| QueueError::Sql { source })?;
        ensure_audit_schema(&connection).map_err(|source| QueueError::Sql { source })?;
        Ok(())
    }

    /// Idempotent producer side: a duplicate `message_id` within the queue is
    /// a no-op.
    pub fn enqueue(
        &self,
        queue: &str,
        message: &QueueMessage,
        now: i64,
    ) -> Result<EnqueueOutcome, QueueError> {
        message.validate().map_err(QueueError::InvalidMessage)?;
        let body = serde_json::to_string(message).map_err(|source| QueueError::Payload {
            message_id: message.message_id.clone(),
            source,
        })?;

        let connection = self.connect()?;
        let inserted = connection
            .execute(
                "INSERT INTO queue_entries (
                    queue, message_id, trace_id, scope_id, message_kind,
                    task_id, parent_task_id, state, retry_count, enqueued_at, message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', 0, ?8, ?9)
                ON CONFLICT(queue, message_id) DO NOTHING",
                params![
                    queue,
                    message.message_id,
                    message.trace_id,
                    message.scope_id.as_str(),
                    message.message_kind.as_str(),
                    message.task_id,
                    message.parent_task_id,
                    now,
                    body,
                ],
            )
            .map_err(|source| QueueError::Sql { source })?;

        if inserted == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }
        append_audit_row(
            &connection,
            now,
            message.scope_id.as_str(),
            AuditEvent::Enqueue,
            &message.message_id,
            &format!("queue={queue}"),
        )
        .map_err(|source| QueueError::Sql { source })?;
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Atomically claims exactly one queued message, oldest first. Entries
    /// whose lease has expired are reclaimed here: back to `queued` with the
    /// retry counter bumped, or to the dead-letter table once the counter
    /// reaches the delivery cap. The immediate transaction guarantees two
    /// concurrent callers can never claim the same entry.
    pub fn lease(
        &self,
        queue: &str,
        owner: &str,
        lease_duration: i64,
        now: i64,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        self.lease_filtered(queue, owner, lease_duration, now, None)
    }

    /// Selective receive for reply waits: claims only a queued message of the
    /// given kind addressed to the given task, leaving everything else
    /// untouched (no retry churn on unrelated messages).
    pub fn lease_reply(
        &self,
        queue: &str,
        owner: &str,
        message_kind: &str,
        task_id: &str,
        lease_duration: i64,
        now: i64,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        self.lease_filtered(
            queue,
            owner,
            lease_duration,
            now,
            Some((message_kind, task_id)),
        )
    }

    fn lease_filtered(
        &self,
        queue: &str,
        owner: &str,
        lease_duration: i64,
        now: i64,
        reply_filter: Option<(&str, &str)>,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;

        self.reclaim_expired_tx(&tx, queue, now)?;

        let candidate = match reply_filter {
            None => tx
                .query_row(
                    "SELECT message_id, scope_id, retry_count, message
                     FROM queue_entries
                     WHERE queue = ?1 AND state = 'queued'
                     ORDER BY enqueued_at, message_id
                     LIMIT 1",
                    params![queue],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|source| QueueError::Sql { source })?,
            Some((kind, task_id)) => tx
                .query_row(
                    "SELECT message_id, scope_id, retry_count, message
                     FROM queue_entries
                     WHERE queue = ?1 AND state = 'queued' AND message_kind = ?2
                       AND (task_id = ?3 OR parent_task_id = ?3)
                     ORDER BY enqueued_at, message_id
                     LIMIT 1",
                    params![queue, kind, task_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|source| QueueError::Sql { source })?,
        };

        let Some((message_id, scope_id, retry_count, body)) = candidate else {
            tx.commit().map_err(|source| QueueError::Sql { source })?;
            return Ok(None);
        };

        let lease_expires_at = now + lease_duration;
        tx.execute(
            "UPDATE queue_entries
             SET state = 'leased', lease_owner = ?1, lease_expires_at = ?2
             WHERE queue = ?3 AND message_id = ?4 AND state = 'queued'",
            params![owner, lease_expires_at, queue, message_id],
        )
        .map_err(|source| QueueError::Sql { source })?;

        append_audit_row(
            &tx,
            now,
            &scope_id,
            AuditEvent::Lease,
            &message_id,
            &format!("queue={queue} owner={owner}"),
        )
        .map_err(|source| QueueError::Sql { source })?;
        tx.commit().map_err(|source| QueueError::Sql { source })?;

        let message: QueueMessage =
            serde_json::from_str(&body).map_err(|source| QueueError::Payload {
                message_id: message_id.clone(),
                source,
            })?;
        Ok(Some(LeasedMessage {
            queue: queue.to_string(),
            message,
            retry_count,
            lease_owner: owner.to_string(),
            lease_expires_at,
        }))
    }

    /// Extends a live lease. A lease that has already expired cannot be
    /// extended; the entry is due for redelivery.
    pub fn heartbeat(
        &self,
        queue: &str,
        message_id: &str,
        extend_by: i64,
        now: i64,
    ) -> Result<i64, QueueError> {
        let connection = self.connect()?;
        let new_expiry = now + extend_by;
        let updated = connection
            .execute(
                "UPDATE queue_entries
                 SET lease_expires_at = ?1
                 WHERE queue = ?2 AND message_id = ?3
                   AND state = 'leased' AND lease_expires_at > ?4",
                params![new_expiry, queue, message_id, now],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if updated == 0 {
            return Err(QueueError::LeaseNotHeld {
                message_id: message_id.to_string(),
            });
        }
        append_audit_row(
            &connection,
            now,
            "",
            AuditEvent::Heartbeat,
            message_id,
            &format!("queue={queue} expires_at={new_expiry}"),
        )
        .map_err(|source| QueueError::Sql { source })?;
        Ok(new_expiry)
    }

    /// Terminal success: the entry is removed.
    pub fn ack(&self, queue: &str, message_id: &str, now: i64) -> Result<(), QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;
        let scope_id = self.entry_scope_tx(&tx, queue, message_id)?;
        let removed = tx
            .execute(
                "DELETE FROM queue_entries WHERE queue = ?1 AND message_id = ?2",
                params![queue, message_id],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if removed == 0 {
            return Err(QueueError::UnknownMessage {
                queue: queue.to_string(),
                message_id: message_id.to_string(),
            });
        }
        append_audit_row(
            &tx,
            now,
            &scope_id,
            AuditEvent::Ack,
            message_id,
            &format!("queue={queue}"),
        )
        .map_err(|source| QueueError::Sql { source })?;
        tx.commit().map_err(|source| QueueError::Sql { source })?;
        Ok(())
    }

    /// Returns the entry to `queued` and bumps the retry counter. Once the
    /// counter reaches the delivery cap the entry is dead-lettered instead.
    pub fn nack(&self, queue: &str, message_id: &str, now: i64) -> Result<NackOutcome, QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;

        let row = tx
            .query_row(
                "SELECT scope_id, retry_count FROM queue_entries
                 WHERE queue = ?1 AND message_id = ?2",
                params![queue, message_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()
            .map_err(|source| QueueError::Sql { source })?;
        let Some((scope_id, retry_count)) = row else {
            return Err(QueueError::UnknownMessage {
                queue: queue.to_string(),
                message_id: message_id.to_string(),
            });
        };

        let next_retry = retry_count + 1;
        let outcome = if next_retry >= self.max_delivery_attempts {
            self.dead_letter_tx(
                &tx,
                queue,
                message_id,
                &scope_id,
                next_retry,
                "retry cap reached",
                now,
            )?;
            NackOutcome::DeadLettered
        } else {
            tx.execute(
                "UPDATE queue_entries
                 SET state = 'queued', lease_owner = NULL, lease_expires_at = NULL,
                     retry_count = ?1
                 WHERE queue = ?2 AND message_id = ?3",
                params![next_retry, queue, message_id],
            )
            .map_err(|source| QueueError::Sql { source })?;
            append_audit_row(
                &tx,
                now,
                &scope_id,
                AuditEvent::Nack,
                message_id,
                &format!("queue={queue} retry_count={next_retry}"),
            )
            .map_err(|source| QueueError::Sql { source })?;
            NackOutcome::Requeued {
                retry_count: next_retry,
            }
        };
        tx.commit().map_err(|source| QueueError::Sql { source })?;
        Ok(outcome)
    }

    /// Explicit terminal failure: archived for inspection.
    pub fn dead_letter(
        &self,
        queue: &str,
        message_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;
        let row = tx
            .query_row(
                "SELECT scope_id, retry_count FROM queue_entries
                 WHERE queue = ?1 AND message_id = ?2",
                params![queue, message_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()
            .map_err(|source| QueueError::Sql { source })?;
        let Some((scope_id, retry_count)) = row else {
            return Err(QueueError::UnknownMessage {
                queue: queue.to_string(),
                message_id: message_id.to_string(),
            });
        };
        self.dead_letter_tx(&tx, queue, message_id, &scope_id, retry_count, reason, now)?;
        tx.commit().map_err(|source| QueueError::Sql { source })?;
        Ok(())
    }

    /// Idempotency ledger: has this consumer already performed the side
    /// effects for this message? Checked before any side effect.
    pub fn has_processed(&self, consumer: &str, message_id: &str) -> Result<bool, QueueError> {
        let connection = self.connect()?;
        let found = connection
            .query_row(
                "SELECT 1 FROM processed_messages WHERE consumer = ?1 AND message_id = ?2",
                params![consumer, message_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|source| QueueError::Sql { source })?;
        Ok(found.is_some())
    }

    /// Recorded after side effects succeed and before the ack.
    pub fn mark_processed(
        &self,
        consumer: &str,
        message_id: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO processed_messages (consumer, message_id, processed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(consumer, message_id) DO NOTHING",
                params![consumer, message_id, now],
            )
            .map_err(|source| QueueError::Sql { source })?;
        Ok(())
    }

    /// Startup recovery: every leased entry goes back to `queued`
    /// unconditionally. A crash mid-lease is indistinguishable from lease
    /// expiry, so the conservative choice is always redelivery.
    pub fn recover_leased(&self, now: i64) -> Result<u32, QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;
        let recovered = tx
            .execute(
                "UPDATE queue_entries
                 SET state = 'queued', lease_owner = NULL, lease_expires_at = NULL
                 WHERE state = 'leased'",
                params![],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if recovered > 0 {
            append_audit_row(
                &tx,
                now,
                "",
                AuditEvent::LeaseRecovered,
                "startup",
                &format!("recovered={recovered}"),
            )
            .map_err(|source| QueueError::Sql { source })?;
        }
        tx.commit().map_err(|source| QueueError::Sql { source })?;
        Ok(recovered as u32)
    }

    pub fn queued_len(&self, queue: &str) -> Result<u64, QueueError> {
        let connection = self.connect()?;
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1 AND state = 'queued'",
                params![queue],
                |row| row.get(0),
            )
            .map_err(|source| QueueError::Sql { source })?;
        Ok(count as u64)
    }

    pub fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetterRecord>, QueueError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT message_id, reason, retry_count, dead_lettered_at, message
                 FROM dead_letters WHERE queue = ?1 ORDER BY dead_lettered_at, message_id",
            )
            .map_err(|source| QueueError::Sql { source })?;
        let rows = statement
            .query_map(params![queue], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|source| QueueError::Sql { source })?;

        let mut records = Vec::new();
        for row in rows {
            let (message_id, reason, retry_count, dead_lettered_at, body) =
                row.map_err(|source| QueueError::Sql { source })?;
            let message =
                serde_json::from_str(&body).map_err(|source| QueueError::Payload {
                    message_id,
                    source,
                })?;
            records.push(DeadLetterRecord {
                queue: queue.to_string(),
                message,
                reason,
                retry_count,
                dead_lettered_at,
            });
        }
        Ok(records)
    }

    pub fn connect(&self) -> Result<Connection, QueueError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| QueueError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|source| QueueError::Sql { source })?;
        Ok(connection)
    }

    fn reclaim_expired_tx(
        &self,
        tx: &Connection,
        queue: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let expired: Vec<(String, String, u32)> = {
            let mut statement = tx
                .prepare(
                    "SELECT message_id, scope_id, retry_count FROM queue_entries
                     WHERE queue = ?1 AND state = 'leased' AND lease_expires_at <= ?2",
                )
                .map_err(|source| QueueError::Sql { source })?;
            let rows = statement
                .query_map(params![queue, now], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                })
                .map_err(|source| QueueError::Sql { source })?;
            rows.collect::<Result<_, _>>()
                .map_err(|source| QueueError::Sql { source })?
        };

        for (message_id, scope_id, retry_count) in expired {
            let next_retry = retry_count + 1;
            if next_retry >= self.max_delivery_attempts {
                self.dead_letter_tx(
                    tx,
                    queue,
                    &message_id,
                    &scope_id,
                    next_retry,
                    "lease expired past retry cap",
                    now,
                )?;
            } else {
                tx.execute(
                    "UPDATE queue_entries
                     SET state = 'queued', lease_owner = NULL, lease_expires_at = NULL,
                         retry_count = ?1
                     WHERE queue = ?2 AND message_id = ?3",
                    params![next_retry, queue, message_id],
                )
                .map_err(|source| QueueError::Sql { source })?;
                append_audit_row(
                    tx,
                    now,
                    &scope_id,
                    AuditEvent::Nack,
                    &message_id,
                    &format!("queue={queue} lease expired, retry_count={next_retry}"),
                )
                .map_err(|source| QueueError::Sql { source })?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dead_letter_tx(
        &self,
        tx: &Connection,
        queue: &str,
        message_id: &str,
        scope_id: &str,
        retry_count: u32,
        reason: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        tx.execute(
            "INSERT INTO dead_letters (
                queue, message_id, reason, retry_count, dead_lettered_at, message
            )
            SELECT queue, message_id, ?1, ?2, ?3, message
            FROM queue_entries WHERE queue = ?4 AND message_id = ?5
            ON CONFLICT(queue, message_id) DO NOTHING",
            params![reason, retry_count, now, queue, message_id],
        )
        .map_err(|source| QueueError::Sql { source })?;
        tx.execute(
            "DELETE FROM queue_entries WHERE queue = ?1 AND message_id = ?2",
            params![queue, message_id],
        )
        .map_err(|source| QueueError::Sql { source })?;
        append_audit_row(
            tx,
            now,
            scope_id,
            AuditEvent::DeadLetter,
            message_id,
            &format!("queue={queue} reason={reason}"),
        )
        .map_err(|source| QueueError::Sql { source })?;
        Ok(())
    }

    fn entry_scope_tx(
        &self,
        tx: &Connection,
        queue: &str,
        message_id: &str,
    ) -> Result<String, QueueError> {
        tx.query_row(
            "SELECT scope_id FROM queue_entries WHERE queue = ?1 AND message_id = ?2",
            params![queue, message_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| QueueError::Sql { source })?
        .ok_or_else(|| QueueError::UnknownMessage {
            queue: queue.to_string(),
            message_id: message_id.to_string(),
        })
    }
}
