use super::ApprovalError;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

/// Replay-protection domains. The domain is part of the primary key, so the
/// same nonce string recorded under `msg` can never collide with, or falsely
/// report as used in, the `exec` domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceDomain {
    /// Inbound message replay protection.
    Msg,
    /// Execution replay protection, bound as `token_id:hash:nonce`.
    Exec,
}

impl NonceDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            NonceDomain::Msg => "msg",
            NonceDomain::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    AlreadyUsed,
}

/// Domain-prefixed replay ledger. Append-only during operation; pruning
/// removes records that can no longer protect anything because every token
/// that could reference them has expired.
#[derive(Debug, Clone)]
pub struct NonceStore {
    db_path: PathBuf,
}

impl NonceStore {
    pub fn open(db_path: &Path) -> Result<Self, ApprovalError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ApprovalError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<(), ApprovalError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS nonces (
                    domain TEXT NOT NULL,
                    binding TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL,
                    PRIMARY KEY (domain, binding)
                );

                CREATE INDEX IF NOT EXISTS idx_nonces_recorded_at
                    ON nonces(recorded_at);
                ",
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(())
    }

    pub fn record(
        &self,
        domain: NonceDomain,
        binding: &str,
        now: i64,
    ) -> Result<RecordOutcome, ApprovalError> {
        let connection = self.connect()?;
        let inserted = connection
            .execute(
                "INSERT INTO nonces (domain, binding, recorded_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(domain, binding) DO NOTHING",
                params![domain.as_str(), binding, now],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(if inserted == 0 {
            RecordOutcome::AlreadyUsed
        } else {
            RecordOutcome::Recorded
        })
    }

    pub fn is_used(&self, domain: NonceDomain, binding: &str) -> Result<bool, ApprovalError> {
        let connection = self.connect()?;
        let found = connection
            .query_row(
                "SELECT 1 FROM nonces WHERE domain = ?1 AND binding = ?2",
                params![domain.as_str(), binding],
                |_| Ok(()),
            )
            .optional()
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(found.is_some())
    }

    /// Removes records older than the retention horizon
    /// (`max_token_ttl + safety_buffer`). Returns the number pruned.
    pub fn prune(&self, now: i64, retention_seconds: i64) -> Result<u32, ApprovalError> {
        let cutoff = now - retention_seconds;
        let connection = self.connect()?;
        let pruned = connection
            .execute(
                "DELETE FROM nonces WHERE recorded_at < ?1",
                params![cutoff],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(pruned as u32)
    }

    pub fn count(&self, domain: NonceDomain) -> Result<u64, ApprovalError> {
        let connection = self.connect()?;
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM nonces WHERE domain = ?1",
                params![domain.as_str()],
                |row| row.get(0),
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(count as u64)
    }

    fn connect(&self) -> Result<Connection, ApprovalError> {
        let connection = Connection::open(&self.db_path).map_err(|source| ApprovalError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(connection)
    }
}
