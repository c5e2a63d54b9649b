use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted watcher checkpoint (§3). Unique per `watcher_id`; written by the
/// dispatcher, never by the watcher itself (§4.1 resume token policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeToken {
    #[serde(rename = "_id")]
    pub watcher_id: String,
    pub token: String,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency ledger entry (§3). Unique on `key`, with a TTL (default 24h,
/// §5) enforced by the store's `set_with_ttl`/index, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    #[serde(rename = "_id")]
    pub key: String,
    pub executed_at: DateTime<Utc>,
    pub execution_id: String,
    pub result_fingerprint: String,
}
