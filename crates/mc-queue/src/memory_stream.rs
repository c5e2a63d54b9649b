use async_trait::async_trait;
use chrono::Utc;
use mc_model::WorkItem;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::kv_stream::{Delivery, KeyValueStream};

struct Entry {
    item: WorkItem,
    delivery_count: u32,
    pending: bool,
    visible_at: i64,
}

/// In-process `KeyValueStream` used by dispatcher/worker unit tests so they
/// don't require a live Redis instance.
#[derive(Default)]
pub struct InMemoryKeyValueStream {
    streams: Mutex<HashMap<String, HashMap<String, Entry>>>,
    dlq: Mutex<HashMap<String, Vec<(WorkItem, String)>>>,
    kv: Mutex<HashMap<String, (String, i64)>>,
}

impl InMemoryKeyValueStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStream for InMemoryKeyValueStream {
    async fn produce(&self, stream: &str, item: WorkItem) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let mut streams = self.streams.lock();
        streams.entry(stream.to_string()).or_default().insert(
            id.clone(),
            Entry { item, delivery_count: 0, pending: false, visible_at: 0 },
        );
        Ok(id)
    }

    async fn consume(&self, stream: &str, _group: &str, _consumer: &str, count: usize, _block_ms: u64) -> Result<Vec<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let mut streams = self.streams.lock();
        let Some(entries) = streams.get_mut(stream) else {
            return Ok(vec![]);
        };
        let mut out = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if out.len() >= count {
                break;
            }
            if entry.pending || entry.visible_at > now {
                continue;
            }
            entry.pending = true;
            entry.delivery_count += 1;
            out.push(Delivery { item_id: id.clone(), item: entry.item.clone(), delivery_count: entry.delivery_count });
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, _group: &str, item_id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(entries) = streams.get_mut(stream) {
            entries.remove(item_id);
        }
        Ok(())
    }

    async fn nack(&self, stream: &str, _group: &str, item_id: &str, delay_ms: u64) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(entries) = streams.get_mut(stream) {
            if let Some(entry) = entries.get_mut(item_id) {
                entry.pending = false;
                entry.visible_at = Utc::now().timestamp_millis() + delay_ms as i64;
            }
        }
        Ok(())
    }

    async fn claim_pending(&self, stream: &str, _group: &str, _consumer: &str, min_idle_ms: u64) -> Result<Vec<Delivery>> {
        // The in-memory fake has no real idle-time tracking; treat every
        // currently pending item as eligible once asked, matching the
        // "recover work from dead workers" intent for tests.
        let _ = min_idle_ms;
        let mut streams = self.streams.lock();
        let Some(entries) = streams.get_mut(stream) else {
            return Ok(vec![]);
        };
        let mut out = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if entry.pending {
                out.push(Delivery { item_id: id.clone(), item: entry.item.clone(), delivery_count: entry.delivery_count });
            }
        }
        Ok(out)
    }

    async fn dlq_push(&self, agent_id: &str, item: WorkItem, reason: &str) -> Result<()> {
        self.dlq.lock().entry(WorkItem::dlq_stream_name(agent_id)).or_default().push((item, reason.to_string()));
        Ok(())
    }

    async fn pending_count(&self, stream: &str, _group: &str) -> Result<u64> {
        let streams = self.streams.lock();
        Ok(streams.get(stream).map(|e| e.values().filter(|v| v.pending).count()).unwrap_or(0) as u64)
    }

    async fn dlq_depth(&self, agent_id: &str) -> Result<u64> {
        let dlq = self.dlq.lock();
        Ok(dlq.get(&WorkItem::dlq_stream_name(agent_id)).map(|v| v.len()).unwrap_or(0) as u64)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let expires_at = Utc::now().timestamp_millis() + ttl_ms as i64;
        self.kv.lock().insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let kv = self.kv.lock();
        Ok(kv.get(key).filter(|(_, exp)| *exp > now).map(|(v, _)| v.clone()))
    }

    async fn setnx(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut kv = self.kv.lock();
        let occupied = kv.get(key).map(|(_, exp)| *exp > now).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        kv.insert(key.to_string(), (value.to_string(), now + ttl_ms as i64));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_model::Trigger;

    fn item() -> WorkItem {
        WorkItem {
            item_id: None,
            agent_id: "classify".to_string(),
            agent_revision: 1,
            document_id: "t1".to_string(),
            document: serde_json::json!({"_id": "t1"}),
            operation: mc_model::Operation::Insert,
            enqueued_at: Utc::now(),
            attempt: 1,
            trigger: Trigger::Change,
            idempotency_key: "t1-classify-1".to_string(),
        }
    }

    #[tokio::test]
    async fn produce_then_consume_delivers_once() {
        let q = InMemoryKeyValueStream::new();
        q.produce("agent:classify", item()).await.unwrap();
        let first = q.consume("agent:classify", "workers", "w1", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = q.consume("agent:classify", "workers", "w1", 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn nack_schedules_future_redelivery() {
        let q = InMemoryKeyValueStream::new();
        q.produce("agent:classify", item()).await.unwrap();
        let delivery = q.consume("agent:classify", "workers", "w1", 10, 0).await.unwrap().remove(0);
        q.nack("agent:classify", "workers", &delivery.item_id, 60_000).await.unwrap();
        let immediate = q.consume("agent:classify", "workers", "w1", 10, 0).await.unwrap();
        assert!(immediate.is_empty());
    }

    #[tokio::test]
    async fn ack_removes_item_from_claim_pending() {
        let q = InMemoryKeyValueStream::new();
        q.produce("agent:classify", item()).await.unwrap();
        let delivery = q.consume("agent:classify", "workers", "w1", 10, 0).await.unwrap().remove(0);
        q.ack("agent:classify", "workers", &delivery.item_id).await.unwrap();
        let claimed = q.claim_pending("agent:classify", "workers", "w2", 0).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn dlq_push_increments_depth() {
        let q = InMemoryKeyValueStream::new();
        assert_eq!(q.dlq_depth("classify").await.unwrap(), 0);
        q.dlq_push("classify", item(), "model_4xx").await.unwrap();
        assert_eq!(q.dlq_depth("classify").await.unwrap(), 1);
    }
}
