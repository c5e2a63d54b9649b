use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata attached alongside a written value when `include_metadata` is set
/// (§4.5). For `append`, `idempotency_key` is always carried regardless of
/// `include_metadata` — the array-dedup precondition needs it in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteEnvelope {
    pub value: Value,
    pub agent_id: String,
    pub agent_revision: u64,
    pub executed_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Array-element shape used by the `append` strategy when metadata is
/// suppressed — still needs the key to dedup against on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalAppendEntry {
    pub value: Value,
    pub idempotency_key: String,
}

impl WriteEnvelope {
    pub fn new(value: Value, agent_id: String, agent_revision: u64, executed_at: DateTime<Utc>, idempotency_key: String) -> Self {
        Self { value, agent_id, agent_revision, executed_at, idempotency_key }
    }
}
