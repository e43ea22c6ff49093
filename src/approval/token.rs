use crate::shared::ids::WorkItemId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// Authorizes executions of one specific plan.
    Single,
    /// Authorizes a class of recurring, goal-spawned tasks.
    Standing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalToken {
    pub token_id: String,
    pub plan_hash: String,
    pub work_item_id: WorkItemId,
    pub scope: ApprovalScope,
    pub verdict: Verdict,
    /// Hex-encoded Ed25519 signature over [`ApprovalToken::signing_payload`].
    pub signature: String,
    pub issued_at: i64,
    pub expires_at: i64,
    /// Token identity. Signed, but never itself consumed against the replay
    /// store; consumption happens through per-execution nonces.
    pub token_nonce: String,
    #[serde(default)]
    pub executions_used: u32,
    pub max_executions: u32,
    #[serde(default)]
    pub execution_nonces: Vec<String>,
    /// Standing tokens only: binds the token to a class of spawned tasks.
    #[serde(default)]
    pub spawn_policy_hash: Option<String>,
}

impl ApprovalToken {
    /// Canonical bytes the signature covers. Every security-relevant field is
    /// included — omitting one would let it be altered undetected. The
    /// mutable execution counters are runtime state and are excluded;
    /// tampering with them is caught by the nonce ledger, not the signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut payload = Map::new();
        payload.insert("tokenId".to_string(), Value::String(self.token_id.clone()));
        payload.insert(
            "planHash".to_string(),
            Value::String(self.plan_hash.clone()),
        );
        payload.insert(
            "workItemId".to_string(),
            Value::String(self.work_item_id.to_string()),
        );
        payload.insert("scope".to_string(), serde_json::to_value(self.scope)?);
        payload.insert("verdict".to_string(), serde_json::to_value(self.verdict)?);
        payload.insert("issuedAt".to_string(), Value::from(self.issued_at));
        payload.insert("expiresAt".to_string(), Value::from(self.expires_at));
        payload.insert(
            "tokenNonce".to_string(),
            Value::String(self.token_nonce.clone()),
        );
        payload.insert(
            "maxExecutions".to_string(),
            Value::from(self.max_executions),
        );
        payload.insert(
            "spawnPolicyHash".to_string(),
            serde_json::to_value(&self.spawn_policy_hash)?,
        );
        Ok(Value::Object(payload).to_string().into_bytes())
    }
}
