use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Operation;

/// Normalized change-feed event (§3), ephemeral — produced by the Watcher,
/// consumed by the Dispatcher. `sequence` is the watcher's own per-stream
/// counter used for the post-ack resume-token handshake (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub watcher_id: String,
    pub resume_token: String,
    pub sequence: u64,
    pub operation: Operation,
    pub database: String,
    pub collection: String,
    pub document_id: String,
    /// Post-image, when the store feed supplies one. Absent on most deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    pub cluster_time: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn matches_collection(&self, database: &str, collection: &str) -> bool {
        self.database == database && self.collection == collection
    }

    pub fn matches_operation(&self, allowed: &[Operation]) -> bool {
        allowed.contains(&self.operation)
    }
}
