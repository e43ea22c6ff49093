pub mod engine;
pub mod nonce;
pub mod plan_hash;
pub mod token;

pub use engine::{ApprovalEngine, Ed25519Signer, TokenSigner};
pub use nonce::{NonceDomain, NonceStore, RecordOutcome};
pub use plan_hash::{plan_hash, spawn_policy_hash};
pub use token::{ApprovalScope, ApprovalToken, Verdict};

/// Why a verify/check was refused. Denials are fail-closed and never retried
/// automatically; every one is logged as a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    UnknownToken,
    NotApproved,
    BadSignature,
    Expired,
    PlanHashMismatch,
    MissingSpawnedTask,
    SpawnParentMismatch,
    SpawnPolicyMismatch,
    ExecutionsExhausted,
    NotYetVerified,
    NonceReplayed,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::UnknownToken => "unknown token",
            DenialReason::NotApproved => "token verdict is not approved",
            DenialReason::BadSignature => "signature verification failed",
            DenialReason::Expired => "token expired",
            DenialReason::PlanHashMismatch => "plan hash mismatch",
            DenialReason::MissingSpawnedTask => "standing token requires a spawned task",
            DenialReason::SpawnParentMismatch => "spawned task parent does not match token",
            DenialReason::SpawnPolicyMismatch => "spawned task violates spawn policy",
            DenialReason::ExecutionsExhausted => "executions exhausted",
            DenialReason::NotYetVerified => "token has not passed verify",
            DenialReason::NonceReplayed => "execution nonce already consumed",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create approval database parent {path}: {source}")]
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
    #[error("failed to encode token `{token_id}`: {source}")]
    Encode {
        token_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode token `{token_id}`: {source}")]
    Decode {
        token_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("canonical payload encoding failed: {0}")]
    Canonical(#[source] serde_json::Error),
    #[error("signing collaborator failed: {0}")]
    Signer(String),
    #[error("nonce generation failed: {0}")]
    NonceGeneration(String),
    #[error("standing approval requires a spawn template at issue time")]
    MissingSpawnTemplate,
    #[error("approval denied for token `{token_id}`: {reason}")]
    Denied {
        token_id: String,
        reason: DenialReason,
    },
}

impl ApprovalError {
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            ApprovalError::Denied { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
