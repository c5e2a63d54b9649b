use async_trait::async_trait;
use mc_model::WorkItem;

use crate::error::Result;

/// A single delivered item, tagged with the queue-assigned ID used to
/// ack/nack/claim it later (§4.3).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item_id: String,
    pub item: WorkItem,
    pub delivery_count: u32,
}

/// Durable append-only stream with consumer groups, per-item ack, and
/// per-item retry counters (§4.3, §6). `KeyValueStream` is the abstract
/// interface; `mc-queue`'s Redis implementation backs it with `XADD` /
/// `XREADGROUP` / `XACK` / `XCLAIM` / `XPENDING` plus `SET ... PX` / `GET` /
/// `SETNX` for TTL keys.
#[async_trait]
pub trait KeyValueStream: Send + Sync {
    async fn produce(&self, stream: &str, item: WorkItem) -> Result<String>;

    async fn consume(&self, stream: &str, group: &str, consumer: &str, count: usize, block_ms: u64) -> Result<Vec<Delivery>>;

    async fn ack(&self, stream: &str, group: &str, item_id: &str) -> Result<()>;

    /// Schedule redelivery after `delay_ms`. Modeled over Redis streams as an
    /// ack of the original entry plus re-`XADD` with an incremented attempt
    /// and a deferred-visibility marker consumed by `claim_pending`.
    async fn nack(&self, stream: &str, group: &str, item_id: &str, delay_ms: u64) -> Result<()>;

    /// Reassign items idle longer than `min_idle_ms` to the calling consumer
    /// (default `min_idle_ms` = 2x `timeout_ms`, §4.3).
    async fn claim_pending(&self, stream: &str, group: &str, consumer: &str, min_idle_ms: u64) -> Result<Vec<Delivery>>;

    async fn dlq_push(&self, agent_id: &str, item: WorkItem, reason: &str) -> Result<()>;

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;

    /// Number of items currently sitting in `agent:<id>:dlq` (§6 `status()`'s
    /// `dlq_depth`, and the `dlq_size` metric).
    async fn dlq_depth(&self, agent_id: &str) -> Result<u64>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns `true` if the key did not already exist (this call set it).
    async fn setnx(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;
}
