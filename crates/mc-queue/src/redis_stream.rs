use async_trait::async_trait;
use chrono::Utc;
use mc_model::WorkItem;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::kv_stream::{Delivery, KeyValueStream};

/// What `nack` stashes in the delayed-payload hash so `promote_due` can
/// restore the delivery count on redelivery instead of resetting it to 1.
#[derive(Serialize, Deserialize)]
struct DelayedEntry {
    payload: String,
    delivery_count: u32,
}

/// Redis-stream-backed `KeyValueStream` (§4.3, §6). One Redis stream per
/// agent (`agent:<id>`), one consumer group (`workers`), a parallel
/// dead-letter stream (`agent:<id>:dlq`), and a per-agent sorted set
/// (`agent:<id>:delayed`) holding nack'd items until their delay elapses —
/// promoted back onto the stream the next time `consume` is called.
pub struct RedisKeyValueStream {
    conn: ConnectionManager,
}

impl RedisKeyValueStream {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn delayed_key(stream: &str) -> String {
        format!("{stream}:delayed")
    }

    fn delayed_payload_key(stream: &str) -> String {
        format!("{stream}:delayed:payload")
    }

    /// Move any delayed items whose visibility time has passed back onto the
    /// live stream, so the following `XREADGROUP` picks them up.
    async fn promote_due(&self, stream: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let delayed_key = Self::delayed_key(stream);
        let payload_key = Self::delayed_payload_key(stream);

        let due: Vec<String> = conn.zrangebyscore(&delayed_key, 0, now).await?;
        for item_id in due {
            let stashed: Option<String> = conn.hget(&payload_key, &item_id).await?;
            let Some(stashed) = stashed else {
                let _: i64 = conn.zrem(&delayed_key, &item_id).await?;
                continue;
            };
            let delayed: DelayedEntry = match serde_json::from_str(&stashed) {
                Ok(d) => d,
                Err(e) => {
                    warn!("dropping malformed delayed entry {}: {}", item_id, e);
                    let _: i64 = conn.zrem(&delayed_key, &item_id).await?;
                    let _: i64 = conn.hdel(&payload_key, &item_id).await?;
                    continue;
                }
            };
            let count_str = delayed.delivery_count.to_string();
            let _: String = conn
                .xadd(stream, "*", &[("payload", delayed.payload.as_str()), ("delivery_count", count_str.as_str())])
                .await?;
            let _: i64 = conn.zrem(&delayed_key, &item_id).await?;
            let _: i64 = conn.hdel(&payload_key, &item_id).await?;
        }
        Ok(())
    }
}

async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> Result<()> {
    let result: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    if let Err(e) = result {
        if !e.to_string().contains("BUSYGROUP") {
            return Err(QueueError::Redis(e));
        }
    }
    Ok(())
}

fn decode_delivery(item_id: String, payload: &str, delivery_count: u32) -> Result<Delivery> {
    let item: WorkItem = serde_json::from_str(payload)
        .map_err(|e| QueueError::Malformed(format!("item {item_id}: {e}")))?;
    Ok(Delivery { item_id, item, delivery_count })
}

/// Entries produced before this field existed (or any other malformed
/// value) are treated as a first delivery.
fn entry_delivery_count(map: &std::collections::HashMap<String, redis::Value>) -> u32 {
    map.get("delivery_count")
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl KeyValueStream for RedisKeyValueStream {
    async fn produce(&self, stream: &str, item: WorkItem) -> Result<String> {
        let mut conn = self.conn.clone();
        ensure_group(&mut conn, stream, "workers").await?;
        let payload = serde_json::to_string(&item).map_err(|e| QueueError::Malformed(e.to_string()))?;
        let item_id: String = conn.xadd(stream, "*", &[("payload", payload.as_str()), ("delivery_count", "1")]).await?;
        Ok(item_id)
    }

    async fn consume(&self, stream: &str, group: &str, consumer: &str, count: usize, block_ms: u64) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        ensure_group(&mut conn, stream, group).await?;
        self.promote_due(stream).await?;

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        let mut deliveries = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload: Option<String> = entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok());
                match payload {
                    Some(p) => {
                        let delivery_count = entry_delivery_count(&entry.map);
                        match decode_delivery(entry.id.clone(), &p, delivery_count) {
                            Ok(d) => deliveries.push(d),
                            Err(e) => warn!("dropping malformed stream entry {}: {}", entry.id, e),
                        }
                    }
                    None => warn!("stream entry {} missing payload field", entry.id),
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, item_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[item_id]).await?;
        Ok(())
    }

    async fn nack(&self, stream: &str, group: &str, item_id: &str, delay_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();

        let range: Vec<redis::streams::StreamId> = conn.xrange(stream, item_id, item_id).await?;
        let Some(entry) = range.into_iter().next() else {
            // Entry already trimmed; nothing to redeliver.
            let _: i64 = conn.xack(stream, group, &[item_id]).await?;
            return Ok(());
        };
        let payload: Option<String> = entry
            .map
            .get("payload")
            .and_then(|v| redis::from_redis_value::<String>(v).ok());
        let Some(payload) = payload else {
            let _: i64 = conn.xack(stream, group, &[item_id]).await?;
            return Ok(());
        };
        let delivery_count = entry_delivery_count(&entry.map) + 1;

        let _: i64 = conn.xack(stream, group, &[item_id]).await?;

        let delayed_id = Uuid::new_v4().to_string();
        let visible_at = Utc::now().timestamp_millis() + delay_ms as i64;
        let payload_key = Self::delayed_payload_key(stream);
        let delayed_key = Self::delayed_key(stream);
        let stashed = serde_json::to_string(&DelayedEntry { payload, delivery_count })
            .map_err(|e| QueueError::Malformed(e.to_string()))?;
        let _: () = conn.hset(&payload_key, &delayed_id, stashed).await?;
        let _: i64 = conn.zadd(&delayed_key, &delayed_id, visible_at).await?;

        debug!(stream, item_id, delay_ms, delivery_count, "item nacked, scheduled for redelivery");
        Ok(())
    }

    async fn claim_pending(&self, stream: &str, group: &str, consumer: &str, min_idle_ms: u64) -> Result<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", 100)
            .await?;

        let mut claimed = Vec::new();
        for entry in pending.ids {
            if entry.time_since_delivered < min_idle_ms as usize {
                continue;
            }
            let reply: StreamReadReply = {
                let result: redis::streams::StreamClaimReply = conn
                    .xclaim(stream, group, consumer, min_idle_ms as usize, &[entry.id.clone()])
                    .await?;
                StreamReadReply {
                    keys: vec![redis::streams::StreamKey { key: stream.to_string(), ids: result.ids }],
                }
            };
            for stream_key in reply.keys {
                for claimed_entry in stream_key.ids {
                    let payload: Option<String> = claimed_entry
                        .map
                        .get("payload")
                        .and_then(|v| redis::from_redis_value::<String>(v).ok());
                    if let Some(p) = payload {
                        // Redis's own PEL counter and our stashed field can each
                        // lag the other depending on which redelivery path fired;
                        // take whichever reflects more attempts.
                        let delivery_count = entry_delivery_count(&claimed_entry.map).max(entry.times_delivered as u32);
                        if let Ok(d) = decode_delivery(claimed_entry.id.clone(), &p, delivery_count) {
                            claimed.push(d);
                        }
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn dlq_push(&self, agent_id: &str, item: WorkItem, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let dlq_stream = WorkItem::dlq_stream_name(agent_id);
        let payload = serde_json::to_string(&item).map_err(|e| QueueError::Malformed(e.to_string()))?;
        let _: String = conn
            .xadd(&dlq_stream, "*", &[("payload", payload.as_str()), ("reason", reason)])
            .await?;
        Ok(())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let info: redis::streams::StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(match info {
            redis::streams::StreamPendingReply::Empty => 0,
            redis::streams::StreamPendingReply::Data(d) => d.count as u64,
        })
    }

    async fn dlq_depth(&self, agent_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(&WorkItem::dlq_stream_name(agent_id)).await?;
        Ok(len)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, (ttl_ms / 1000).max(1)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn setnx(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: bool = conn.set_nx(key, value).await?;
        if set {
            let _: () = conn.pexpire(key, ttl_ms as i64).await?;
        }
        Ok(set)
    }
}
