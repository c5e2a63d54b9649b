use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Operation;

/// What caused a WorkItem to be produced (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Change,
    Webhook,
    Retry,
}

/// Queue payload (§3), owned by the queue between produce and ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Assigned by the queue client on produce; absent until then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub agent_id: String,
    pub agent_revision: u64,
    pub document_id: String,
    pub document: Value,
    pub operation: Operation,
    pub enqueued_at: DateTime<Utc>,
    /// Starts at 1; incremented on each redelivery (§4.4).
    pub attempt: u32,
    pub trigger: Trigger,
    pub idempotency_key: String,
}

impl WorkItem {
    pub fn stream_name(agent_id: &str) -> String {
        format!("agent:{agent_id}")
    }

    pub fn dlq_stream_name(agent_id: &str) -> String {
        format!("agent:{agent_id}:dlq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_are_namespaced_per_agent() {
        assert_eq!(WorkItem::stream_name("classify"), "agent:classify");
        assert_eq!(WorkItem::dlq_stream_name("classify"), "agent:classify:dlq");
    }
}
