use super::nonce::{NonceDomain, NonceStore, RecordOutcome};
use super::plan_hash::{plan_hash, spawn_policy_hash};
use super::token::{ApprovalScope, ApprovalToken, Verdict};
use super::{ApprovalError, DenialReason};
use crate::audit::{append_audit_row, ensure_audit_schema, AuditEvent};
use crate::shared::ids::generate_id;
use crate::shared::logging::append_security_log_line;
use crate::work::item::WorkItem;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use getrandom::getrandom;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Signing collaborator boundary. The engine never holds key material beyond
/// this call; production deployments put the private key behind it.
pub trait TokenSigner {
    fn sign(&self, payload: &[u8]) -> Result<Signature, ApprovalError>;
}

pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn generate() -> Result<Self, ApprovalError> {
        let mut seed = [0_u8; 32];
        getrandom(&mut seed)
            .map_err(|err| ApprovalError::NonceGeneration(err.to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl TokenSigner for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Result<Signature, ApprovalError> {
        Ok(self.signing_key.sign(payload))
    }
}

/// Issues, verifies (consuming) and checks (non-consuming) execution
/// authorizations. Tokens are persisted here; `executions_used` is durable
/// before any caller may act on a successful verify.
pub struct ApprovalEngine {
    db_path: PathBuf,
    state_root: PathBuf,
    signer: Box<dyn TokenSigner + Send + Sync>,
    verifying_key: VerifyingKey,
    nonces: NonceStore,
    max_token_ttl_seconds: i64,
}

impl ApprovalEngine {
    pub fn open(
        state_root: &Path,
        db_path: &Path,
        signer: Box<dyn TokenSigner + Send + Sync>,
        verifying_key: VerifyingKey,
        max_token_ttl_seconds: i64,
    ) -> Result<Self, ApprovalError> {
        let nonces = NonceStore::open(db_path)?;
        let engine = Self {
            db_path: db_path.to_path_buf(),
            state_root: state_root.to_path_buf(),
            signer,
            verifying_key,
            nonces,
            max_token_ttl_seconds,
        };
        engine.ensure_schema()?;
        Ok(engine)
    }

    pub fn ensure_schema(&self) -> Result<(), ApprovalError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS approval_tokens (
                    token_id TEXT NOT NULL PRIMARY KEY,
                    work_item_id TEXT NOT NULL,
                    token TEXT NOT NULL
                );
                ",
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        ensure_audit_schema(&connection).map_err(|source| ApprovalError::Sql { source })?;
        Ok(())
    }

    pub fn nonce_store(&self) -> &NonceStore {
        &self.nonces
    }

    /// Computes the canonical plan hash, signs the full canonical payload and
    /// persists the token. Standing approvals additionally bind a spawn
    /// policy derived from the supplied template.
    pub fn issue(
        &self,
        work_item: &WorkItem,
        verdict: Verdict,
        scope: ApprovalScope,
        max_executions: u32,
        spawn_template: Option<&WorkItem>,
        now: i64,
    ) -> Result<ApprovalToken, ApprovalError> {
        let item_plan_hash = plan_hash(work_item).map_err(ApprovalError::Canonical)?;
        let policy_hash = match scope {
            ApprovalScope::Single => None,
            ApprovalScope::Standing => {
                let template = spawn_template.ok_or(ApprovalError::MissingSpawnTemplate)?;
                Some(spawn_policy_hash(template).map_err(ApprovalError::Canonical)?)
            }
        };

        let mut token = ApprovalToken {
            token_id: generate_id("token").map_err(ApprovalError::NonceGeneration)?,
            plan_hash: item_plan_hash,
            work_item_id: work_item.work_item_id.clone(),
            scope,
            verdict,
            signature: String::new(),
            issued_at: now,
            expires_at: now + self.max_token_ttl_seconds,
            token_nonce: generate_id("nonce").map_err(ApprovalError::NonceGeneration)?,
            executions_used: 0,
            max_executions,
            execution_nonces: Vec::new(),
            spawn_policy_hash: policy_hash,
        };
        let payload = token.signing_payload().map_err(ApprovalError::Canonical)?;
        token.signature = hex::encode(self.signer.sign(&payload)?.to_bytes());

        self.insert_token(&token)?;
        let connection = self.connect()?;
        append_audit_row(
            &connection,
            now,
            work_item.scope_id.as_str(),
            AuditEvent::ApprovalIssued,
            &token.token_id,
            &format!(
                "work_item={} scope={:?} max_executions={}",
                work_item.work_item_id, scope, max_executions
            ),
        )
        .map_err(|source| ApprovalError::Sql { source })?;
        Ok(token)
    }

    /// Consuming verification: the approval-time decision point. On success
    /// exactly one fresh execution nonce is recorded in the `exec` domain and
    /// `executions_used` is incremented and persisted before returning.
    pub fn verify(
        &self,
        token_id: &str,
        work_item: &WorkItem,
        spawned_task: Option<&WorkItem>,
        now: i64,
    ) -> Result<ApprovalToken, ApprovalError> {
        let mut token = self.load_required(token_id, work_item, now)?;
        let binding_hash = match self.validate_token(&token, work_item, spawned_task, now) {
            Ok(hash) => hash,
            Err(reason) => return Err(self.deny(&token, work_item, reason, now)),
        };
        if token.executions_used >= token.max_executions {
            return Err(self.deny(&token, work_item, DenialReason::ExecutionsExhausted, now));
        }

        let execution_nonce =
            generate_id("exec").map_err(ApprovalError::NonceGeneration)?;
        let binding = format!("{}:{}:{}", token.token_id, binding_hash, execution_nonce);
        match self.nonces.record(NonceDomain::Exec, &binding, now)? {
            RecordOutcome::Recorded => {}
            RecordOutcome::AlreadyUsed => {
                return Err(self.deny(&token, work_item, DenialReason::NonceReplayed, now));
            }
        }

        token.executions_used += 1;
        token.execution_nonces.push(execution_nonce);
        self.update_token(&token)?;

        let connection = self.connect()?;
        append_audit_row(
            &connection,
            now,
            work_item.scope_id.as_str(),
            AuditEvent::ApprovalVerified,
            &token.token_id,
            &format!(
                "executions_used={}/{}",
                token.executions_used, token.max_executions
            ),
        )
        .map_err(|source| ApprovalError::Sql { source })?;
        Ok(token)
    }

    /// Non-consuming check: the execution entry gate. Same validations as
    /// `verify` but it never touches the nonce ledger, and it requires the
    /// token to have been through `verify` at least once — so idempotent
    /// retries after redelivery cannot burn additional nonces.
    pub fn check(
        &self,
        token_id: &str,
        work_item: &WorkItem,
        now: i64,
    ) -> Result<ApprovalToken, ApprovalError> {
        let token = self.load_required(token_id, work_item, now)?;
        let spawned = match token.scope {
            ApprovalScope::Single => None,
            // at the entry gate the executing item *is* the spawned task
            ApprovalScope::Standing => Some(work_item),
        };
        let bound_item = match token.scope {
            ApprovalScope::Single => Some(work_item),
            ApprovalScope::Standing => None,
        };
        if let Err(reason) = self.validate_check(&token, bound_item, spawned, now) {
            return Err(self.deny(&token, work_item, reason, now));
        }
        if token.executions_used == 0 {
            return Err(self.deny(&token, work_item, DenialReason::NotYetVerified, now));
        }
        if token.executions_used > token.max_executions {
            return Err(self.deny(&token, work_item, DenialReason::ExecutionsExhausted, now));
        }

        let connection = self.connect()?;
        append_audit_row(
            &connection,
            now,
            work_item.scope_id.as_str(),
            AuditEvent::ApprovalChecked,
            &token.token_id,
            &format!("work_item={}", work_item.work_item_id),
        )
        .map_err(|source| ApprovalError::Sql { source })?;
        Ok(token)
    }

    pub fn load_token(&self, token_id: &str) -> Result<Option<ApprovalToken>, ApprovalError> {
        let connection = self.connect()?;
        let body: Option<String> = connection
            .query_row(
                "SELECT token FROM approval_tokens WHERE token_id = ?1",
                params![token_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| ApprovalError::Sql { source })?;
        match body {
            None => Ok(None),
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|source| ApprovalError::Decode {
                    token_id: token_id.to_string(),
                    source,
                }),
        }
    }

    fn load_required(
        &self,
        token_id: &str,
        work_item: &WorkItem,
        now: i64,
    ) -> Result<ApprovalToken, ApprovalError> {
        match self.load_token(token_id)? {
            Some(token) => Ok(token),
            None => {
                self.record_denial(token_id, work_item, DenialReason::UnknownToken, now)?;
                Err(ApprovalError::Denied {
                    token_id: token_id.to_string(),
                    reason: DenialReason::UnknownToken,
                })
            }
        }
    }

    /// Shared validations for verify: signature, verdict, expiry, hash
    /// bindings. Returns the hash the execution-nonce binding uses.
    fn validate_token(
        &self,
        token: &ApprovalToken,
        work_item: &WorkItem,
        spawned_task: Option<&WorkItem>,
        now: i64,
    ) -> Result<String, DenialReason> {
        self.validate_signature(token)?;
        if token.verdict != Verdict::Approved {
            return Err(DenialReason::NotApproved);
        }
        if now >= token.expires_at {
            return Err(DenialReason::Expired);
        }
        let item_hash = plan_hash(work_item).map_err(|_| DenialReason::PlanHashMismatch)?;
        if item_hash != token.plan_hash {
            return Err(DenialReason::PlanHashMismatch);
        }
        match token.scope {
            ApprovalScope::Single => Ok(token.plan_hash.clone()),
            ApprovalScope::Standing => {
                let spawned = spawned_task.ok_or(DenialReason::MissingSpawnedTask)?;
                self.validate_spawned(token, spawned)
            }
        }
    }

    /// Check-time validations. Single tokens validate the plan hash of the
    /// executing item; standing tokens validate the executing item as a
    /// member of the approved spawn class (verify already bound the goal).
    fn validate_check(
        &self,
        token: &ApprovalToken,
        bound_item: Option<&WorkItem>,
        spawned_task: Option<&WorkItem>,
        now: i64,
    ) -> Result<(), DenialReason> {
        self.validate_signature(token)?;
        if token.verdict != Verdict::Approved {
            return Err(DenialReason::NotApproved);
        }
        if now >= token.expires_at {
            return Err(DenialReason::Expired);
        }
        if let Some(item) = bound_item {
            let item_hash = plan_hash(item).map_err(|_| DenialReason::PlanHashMismatch)?;
            if item_hash != token.plan_hash {
                return Err(DenialReason::PlanHashMismatch);
            }
        }
        if let Some(spawned) = spawned_task {
            self.validate_spawned(token, spawned)?;
        }
        Ok(())
    }

    fn validate_spawned(
        &self,
        token: &ApprovalToken,
        spawned: &WorkItem,
    ) -> Result<String, DenialReason> {
        if spawned.parent.as_ref() != Some(&token.work_item_id) {
            return Err(DenialReason::SpawnParentMismatch);
        }
        let policy_hash =
            spawn_policy_hash(spawned).map_err(|_| DenialReason::SpawnPolicyMismatch)?;
        match token.spawn_policy_hash.as_deref() {
            Some(bound) if bound == policy_hash => Ok(policy_hash),
            _ => Err(DenialReason::SpawnPolicyMismatch),
        }
    }

    fn validate_signature(&self, token: &ApprovalToken) -> Result<(), DenialReason> {
        let payload = token
            .signing_payload()
            .map_err(|_| DenialReason::BadSignature)?;
        let raw = hex::decode(&token.signature).map_err(|_| DenialReason::BadSignature)?;
        let signature =
            Signature::from_slice(&raw).map_err(|_| DenialReason::BadSignature)?;
        self.verifying_key
            .verify(&payload, &signature)
            .map_err(|_| DenialReason::BadSignature)
    }

    fn deny(
        &self,
        token: &ApprovalToken,
        work_item: &WorkItem,
        reason: DenialReason,
        now: i64,
    ) -> ApprovalError {
        if let Err(err) = self.record_denial(&token.token_id, work_item, reason, now) {
            return err;
        }
        ApprovalError::Denied {
            token_id: token.token_id.clone(),
            reason,
        }
    }

    fn record_denial(
        &self,
        token_id: &str,
        work_item: &WorkItem,
        reason: DenialReason,
        now: i64,
    ) -> Result<(), ApprovalError> {
        let connection = self.connect()?;
        append_audit_row(
            &connection,
            now,
            work_item.scope_id.as_str(),
            AuditEvent::ApprovalDenied,
            token_id,
            reason.as_str(),
        )
        .map_err(|source| ApprovalError::Sql { source })?;
        append_security_log_line(
            &self.state_root,
            "approval_denied",
            &format!(
                "token={token_id} work_item={} reason={reason}",
                work_item.work_item_id
            ),
        );
        Ok(())
    }

    fn insert_token(&self, token: &ApprovalToken) -> Result<(), ApprovalError> {
        let body = serde_json::to_string(token).map_err(|source| ApprovalError::Encode {
            token_id: token.token_id.clone(),
            source,
        })?;
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO approval_tokens (token_id, work_item_id, token)
                 VALUES (?1, ?2, ?3)",
                params![token.token_id, token.work_item_id.as_str(), body],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(())
    }

    fn update_token(&self, token: &ApprovalToken) -> Result<(), ApprovalError> {
        let body = serde_json::to_string(token).map_err(|source| ApprovalError::Encode {
            token_id: token.token_id.clone(),
            source,
        })?;
        let connection = self.connect()?;
        connection
            .execute(
                "UPDATE approval_tokens SET token = ?1 WHERE token_id = ?2",
                params![body, token.token_id],
            )
            .map_err(|source| ApprovalError::Sql { source })?;
        Ok(())
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
