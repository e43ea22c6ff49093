use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Every state transition the runtime makes lands in this table: queue
/// deliveries, approval outcomes, gate blocks, escalations. Rows are written
/// inside the same transaction as the transition they describe, so the audit
/// trail can never disagree with the durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Enqueue,
    Lease,
    Heartbeat,
    Ack,
    Nack,
    DeadLetter,
    LeaseRecovered,
    ApprovalIssued,
    ApprovalVerified,
    ApprovalChecked,
    ApprovalDenied,
    GateBlocked,
    StatusChanged,
    Escalated,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Enqueue => "enqueue",
            AuditEvent::Lease => "lease",
            AuditEvent::Heartbeat => "heartbeat",
            AuditEvent::Ack => "ack",
            AuditEvent::Nack => "nack",
            AuditEvent::DeadLetter => "dead_letter",
            AuditEvent::LeaseRecovered => "lease_recovered",
            AuditEvent::ApprovalIssued => "approval_issued",
            AuditEvent::ApprovalVerified => "approval_verified",
            AuditEvent::ApprovalChecked => "approval_checked",
            AuditEvent::ApprovalDenied => "approval_denied",
            AuditEvent::GateBlocked => "gate_blocked",
            AuditEvent::StatusChanged => "status_changed",
            AuditEvent::Escalated => "escalated",
        }
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub at: i64,
    pub scope_id: String,
    pub event: String,
    pub subject_id: String,
    pub detail: String,
}

pub fn ensure_audit_schema(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_log (
            at INTEGER NOT NULL,
            scope_id TEXT NOT NULL,
            event TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            detail TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_scope_at
            ON audit_log(scope_id, at);
        ",
    )
}

/// Append within the caller's transaction or connection.
pub fn append_audit_row(
    connection: &Connection,
    at: i64,
    scope_id: &str,
    event: AuditEvent,
    subject_id: &str,
    detail: &str,
) -> Result<(), rusqlite::Error> {
    connection.execute(
        "INSERT INTO audit_log (at, scope_id, event, subject_id, detail)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![at, scope_id, event.as_str(), subject_id, detail],
    )?;
    Ok(())
}

pub fn rows_for_subject(
    connection: &Connection,
    subject_id: &str,
) -> Result<Vec<AuditRow>, rusqlite::Error> {
    let mut statement = connection.prepare(
        "SELECT at, scope_id, event, subject_id, detail
         FROM audit_log WHERE subject_id = ?1 ORDER BY at, rowid",
    )?;
    let rows = statement.query_map(params![subject_id], |row| {
        Ok(AuditRow {
            at: row.get(0)?,
            scope_id: row.get(1)?,
            event: row.get(2)?,
            subject_id: row.get(3)?,
            detail: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn rows_for_event(
    connection: &Connection,
    event: AuditEvent,
) -> Result<Vec<AuditRow>, rusqlite::Error> {
    let mut statement = connection.prepare(
        "SELECT at, scope_id, event, subject_id, detail
         FROM audit_log WHERE event = ?1 ORDER BY at, rowid",
    )?;
    let rows = statement.query_map(params![event.as_str()], |row| {
        Ok(AuditRow {
            at: row.get(0)?,
            scope_id: row.get(1)?,
            event: row.get(2)?,
            subject_id: row.get(3)?,
            detail: row.get(4)?,
        })
    })?;
    rows.collect()
}
