use crate::work::item::WorkItem;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON of the immutable work-item projection.
/// serde_json objects iterate in key order, so serializing the map compactly
/// yields sorted keys with no insignificant whitespace. Runtime fields
/// (`status`, `attempts`, `budget_used`, `approval_token_id`, ...) are
/// deliberately absent: two snapshots differing only in runtime state must
/// hash identically.
pub fn plan_hash(item: &WorkItem) -> Result<String, serde_json::Error> {
    let mut projection = Map::new();
    projection.insert(
        "workItemId".to_string(),
        Value::String(item.work_item_id.to_string()),
    );
    projection.insert(
        "scopeId".to_string(),
        Value::String(item.scope_id.to_string()),
    );
    projection.insert("itemType".to_string(), serde_json::to_value(item.item_type)?);
    projection.insert("budget".to_string(), serde_json::to_value(&item.budget)?);
    projection.insert("briefing".to_string(), Value::String(item.briefing.clone()));
    projection.insert("skills".to_string(), serde_json::to_value(&item.skills)?);
    projection.insert("gates".to_string(), serde_json::to_value(&item.gates)?);
    projection.insert(
        "escalation".to_string(),
        serde_json::to_value(&item.escalation)?,
    );
    projection.insert(
        "verificationChecks".to_string(),
        serde_json::to_value(&item.verification_checks)?,
    );
    projection.insert("schedule".to_string(), serde_json::to_value(&item.schedule)?);
    projection.insert("onStuck".to_string(), serde_json::to_value(item.on_stuck)?);
    projection.insert(
        "resources".to_string(),
        serde_json::to_value(&item.resources)?,
    );
    projection.insert("parent".to_string(), serde_json::to_value(&item.parent)?);
    projection.insert(
        "dependsOn".to_string(),
        serde_json::to_value(&item.depends_on)?,
    );
    projection.insert("tasks".to_string(), serde_json::to_value(&item.tasks)?);
    projection.insert(
        "followUpOf".to_string(),
        serde_json::to_value(&item.follow_up_of)?,
    );
    Ok(digest_value(&Value::Object(projection)))
}

/// Hash of the class-defining fields of a spawned task: what it may do and
/// under which ceilings, not which instance it is. Binds a standing token to
/// a class of future goal-spawned tasks without knowing their ids or
/// briefings in advance.
pub fn spawn_policy_hash(template: &WorkItem) -> Result<String, serde_json::Error> {
    let mut projection = Map::new();
    projection.insert(
        "itemType".to_string(),
        serde_json::to_value(template.item_type)?,
    );
    projection.insert("budget".to_string(), serde_json::to_value(&template.budget)?);
    projection.insert("skills".to_string(), serde_json::to_value(&template.skills)?);
    projection.insert("gates".to_string(), serde_json::to_value(&template.gates)?);
    projection.insert(
        "escalation".to_string(),
        serde_json::to_value(&template.escalation)?,
    );
    projection.insert(
        "verificationChecks".to_string(),
        serde_json::to_value(&template.verification_checks)?,
    );
    projection.insert(
        "onStuck".to_string(),
        serde_json::to_value(template.on_stuck)?,
    );
    Ok(digest_value(&Value::Object(projection)))
}

fn digest_value(value: &Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
