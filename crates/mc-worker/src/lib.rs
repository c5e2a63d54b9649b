//! Worker pool (§4.4): long-lived loops that round-robin over every enabled
//! agent's stream, running each claimed item through claim → idempotency
//! check → admission → render → invoke → parse/validate → write → finalize.
//!
//! Grounded on `fc-router::pool::ProcessPool`'s semaphore-bounded consume
//! loop, generalized from a single shared queue to per-agent streams and
//! from message-group ordering to the admission-gate/retry-tag pipeline.

mod classify;
mod error;
mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use mc_model::Agent;
use mc_queue::KeyValueStream;
use mc_resilience::AdmissionGate;
use mc_store::{AgentStore, ExecutionLedger, IdempotencyStore, MetricsSink};
use mc_store::ModelClient;
use mc_write::WriteEngine;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

pub use error::{Result, WorkerError};

/// Shared dependencies every worker task pulls from (§6 "Consumed
/// interfaces"). Cheap to clone: everything is already behind an `Arc`.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn KeyValueStream>,
    pub agent_store: Arc<dyn AgentStore>,
    pub model_client: Arc<dyn ModelClient>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub write_engine: Arc<WriteEngine>,
    pub admission: Arc<AdmissionGate>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Bounded pool of worker tasks consuming every enabled agent's stream in
/// round-robin (§4.4: "acceptable for ≤ O(100) agents", the fleet size this
/// system targets — see the REDESIGN FLAGS on sharding for larger fleets).
pub struct WorkerPool {
    deps: WorkerDeps,
    worker_count: usize,
    poll_block_ms: u64,
    consumer_group: String,
}

impl WorkerPool {
    pub fn new(deps: WorkerDeps, worker_count: usize, poll_block_ms: u64) -> Self {
        Self { deps, worker_count, poll_block_ms, consumer_group: "workers".to_string() }
    }

    /// Run `worker_count` tasks until `shutdown` fires, then wait for them to
    /// drain their current item.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(self.worker_count);

        for idx in 0..self.worker_count {
            let consumer_name = format!("worker-{idx}");
            let deps = self.deps.clone();
            let semaphore = semaphore.clone();
            let poll_block_ms = self.poll_block_ms;
            let group = self.consumer_group.clone();
            let mut shutdown = shutdown.resubscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.try_recv().is_ok() {
                        info!(consumer = %consumer_name, "worker stopping");
                        return;
                    }

                    let agents = match deps.agent_store.list_enabled().await {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "worker failed to list enabled agents, backing off");
                            tokio::time::sleep(Duration::from_millis(poll_block_ms)).await;
                            continue;
                        }
                    };

                    if agents.is_empty() {
                        tokio::time::sleep(Duration::from_millis(poll_block_ms)).await;
                        continue;
                    }

                    let mut claimed_any = false;
                    for agent in &agents {
                        if shutdown.try_recv().is_ok() {
                            return;
                        }
                        claimed_any |= poll_agent_once(&deps, &semaphore, agent, &consumer_name, &group, poll_block_ms).await;
                    }

                    if !claimed_any {
                        tokio::time::sleep(Duration::from_millis(poll_block_ms)).await;
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Consume up to one batch from a single agent's stream and spawn processing
/// for each item, bounded by `semaphore`. Returns `true` if anything was
/// claimed, so the caller's round-robin loop can skip its idle sleep.
async fn poll_agent_once(
    deps: &WorkerDeps,
    semaphore: &Arc<Semaphore>,
    agent: &Agent,
    consumer_name: &str,
    group: &str,
    block_ms: u64,
) -> bool {
    let stream = mc_model::WorkItem::stream_name(&agent.id);
    let permits = semaphore.available_permits().max(1);
    let deliveries = match deps.queue.consume(&stream, group, consumer_name, permits, block_ms).await {
        Ok(d) => d,
        Err(e) => {
            warn!(agent_id = %agent.id, error = %e, "consume failed");
            return false;
        }
    };
    if deliveries.is_empty() {
        return false;
    }

    for delivery in deliveries {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return true,
        };
        let deps = deps.clone();
        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline::process_one(&deps, &agent_id, delivery).await;
        });
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream::BoxStream;
    use mc_expr::Template;
    use mc_model::{AiSpec, ConsistencyMode, Execution, ExecutionSpec, IdempotencyRecord, Operation, WatchSpec, WriteSpec, WriteStrategy};
    use mc_queue::InMemoryKeyValueStream;
    use mc_store::{
        DocumentPatch, DocumentStore, FeedEvent, InMemoryAgentStore, ModelError, ModelErrorKind, ModelRequest, ModelResponse, NullMetricsSink,
        StoreError, UpdateOutcome, UpdatePrecondition,
    };
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn sample_agent() -> Agent {
        Agent {
            id: "classify".to_string(),
            name: "Classify tickets".to_string(),
            enabled: true,
            tags: vec![],
            watch: WatchSpec {
                database: "support".to_string(),
                collection: "tickets".to_string(),
                operations: vec![Operation::Insert],
                filter: serde_json::Value::Null,
            },
            ai: AiSpec {
                provider: "anthropic".to_string(),
                model: "claude".to_string(),
                prompt: Template::parse("category hint: {{document.category_hint}}").unwrap(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 256,
                response_schema: None,
            },
            write: WriteSpec {
                strategy: WriteStrategy::Merge,
                target_field: "ai_triage".to_string(),
                idempotency_key: Template::parse("{{document._id}}-classify-{{agent.revision}}").unwrap(),
                include_metadata: true,
            },
            execution: ExecutionSpec {
                max_retries: 2,
                retry_delay_ms: 10,
                timeout_ms: 5_000,
                rate_limit_per_minute: 1_000,
                cost_limit_usd_per_hour: 100.0,
                consistency_mode: ConsistencyMode::Eventual,
            },
            revision: 1,
        }
    }

    fn sample_item(agent: &Agent) -> mc_model::WorkItem {
        let document = serde_json::json!({"_id": "t1", "category_hint": "billing"});
        mc_model::WorkItem {
            item_id: None,
            agent_id: agent.id.clone(),
            agent_revision: agent.revision,
            document_id: "t1".to_string(),
            document,
            operation: Operation::Insert,
            enqueued_at: Utc::now(),
            attempt: 1,
            trigger: mc_model::Trigger::Change,
            idempotency_key: "t1-classify-1".to_string(),
        }
    }

    /// Returns the same outcome on every call — `ModelError` isn't `Clone`, so
    /// errors are described by `(kind, message)` and rebuilt per invocation.
    struct FakeModelClient {
        response: Option<ModelResponse>,
        error: Option<(ModelErrorKind, &'static str)>,
    }

    impl FakeModelClient {
        fn ok(response: ModelResponse) -> Self {
            Self { response: Some(response), error: None }
        }

        fn err(kind: ModelErrorKind, message: &'static str) -> Self {
            Self { response: None, error: Some((kind, message)) }
        }
    }

    #[async_trait]
    impl mc_store::ModelClient for FakeModelClient {
        async fn invoke(&self, _request: ModelRequest) -> mc_store::Result<ModelResponse> {
            if let Some((kind, message)) = self.error {
                return Err(StoreError::Model(ModelError::new(kind, message)));
            }
            Ok(self.response.clone().expect("fake model client configured with neither response nor error"))
        }
    }

    struct FakeDocumentStore {
        applied: Mutex<Vec<(String, UpdatePrecondition)>>,
    }

    #[async_trait]
    impl DocumentStore for FakeDocumentStore {
        async fn subscribe(&self, _database: &str, _collection: &str, _resume_token: Option<String>) -> mc_store::Result<BoxStream<'static, mc_store::Result<FeedEvent>>> {
            unimplemented!("not exercised by worker pipeline tests")
        }

        async fn update(&self, _database: &str, _collection: &str, document_id: &str, patch: DocumentPatch, precondition: UpdatePrecondition) -> mc_store::Result<UpdateOutcome> {
            self.applied.lock().push((document_id.to_string(), precondition));
            let _ = patch;
            Ok(UpdateOutcome { matched: 1, modified: 1 })
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        executions: Mutex<Vec<Execution>>,
    }

    #[async_trait]
    impl ExecutionLedger for FakeLedger {
        async fn record(&self, execution: &Execution) -> mc_store::Result<()> {
            self.executions.lock().push(execution.clone());
            Ok(())
        }

        async fn recent_for_agent(&self, _agent_id: &str, _limit: i64) -> mc_store::Result<Vec<Execution>> {
            Ok(self.executions.lock().clone())
        }
    }

    #[derive(Default)]
    struct FakeIdempotencyStore {
        records: Mutex<HashMap<String, IdempotencyRecord>>,
    }

    #[async_trait]
    impl IdempotencyStore for FakeIdempotencyStore {
        async fn get(&self, key: &str) -> mc_store::Result<Option<IdempotencyRecord>> {
            Ok(self.records.lock().get(key).cloned())
        }

        async fn set_if_absent(&self, record: &IdempotencyRecord) -> mc_store::Result<bool> {
            let mut records = self.records.lock();
            if records.contains_key(&record.key) {
                return Ok(false);
            }
            records.insert(record.key.clone(), record.clone());
            Ok(true)
        }
    }

    fn deps_with(model_client: FakeModelClient, document_store: Arc<FakeDocumentStore>) -> (WorkerDeps, Arc<FakeLedger>, Arc<InMemoryKeyValueStream>) {
        let agent_store = Arc::new(InMemoryAgentStore::new());
        agent_store.upsert(sample_agent());
        let ledger = Arc::new(FakeLedger::default());
        let queue = Arc::new(InMemoryKeyValueStream::new());
        let deps = WorkerDeps {
            queue: queue.clone(),
            agent_store,
            model_client: Arc::new(model_client),
            ledger: ledger.clone(),
            idempotency: Arc::new(FakeIdempotencyStore::default()),
            write_engine: Arc::new(WriteEngine::new(document_store)),
            admission: Arc::new(AdmissionGate::new(3, 30.0)),
            metrics: Arc::new(NullMetricsSink),
        };
        (deps, ledger, queue)
    }

    #[tokio::test]
    async fn successful_invocation_writes_and_acks() {
        let agent = sample_agent();
        let document_store = Arc::new(FakeDocumentStore { applied: Mutex::new(vec![]) });
        let (deps, ledger, queue) = deps_with(
            FakeModelClient::ok(ModelResponse { text: "billing".to_string(), tokens_used: 10, cost_usd: 0.01 }),
            document_store.clone(),
        );

        let stream = mc_model::WorkItem::stream_name(&agent.id);
        queue.produce(&stream, sample_item(&agent)).await.unwrap();
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);

        pipeline::process_one(&deps, &agent.id, delivery).await;

        let executions = ledger.executions.lock();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, mc_model::ExecutionStatus::Completed);
        assert!(executions[0].written);
        assert_eq!(document_store.applied.lock().len(), 1);
        assert_eq!(queue.pending_count(&stream, "workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idempotent_replay_skips_without_invoking_model() {
        let agent = sample_agent();
        let document_store = Arc::new(FakeDocumentStore { applied: Mutex::new(vec![]) });
        let (deps, ledger, queue) = deps_with(FakeModelClient::err(ModelErrorKind::Other, "should not be called"), document_store);

        let item = sample_item(&agent);
        deps.idempotency
            .set_if_absent(&IdempotencyRecord {
                key: item.idempotency_key.clone(),
                executed_at: Utc::now(),
                execution_id: "prior".to_string(),
                result_fingerprint: "abc".to_string(),
            })
            .await
            .unwrap();

        let stream = mc_model::WorkItem::stream_name(&agent.id);
        queue.produce(&stream, item).await.unwrap();
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);

        pipeline::process_one(&deps, &agent.id, delivery).await;

        let executions = ledger.executions.lock();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, mc_model::ExecutionStatus::Skipped);
        assert_eq!(executions[0].lifecycle_state, "idempotent_replay");
    }

    #[tokio::test]
    async fn model_timeout_retries_then_dlqs_after_max_attempts() {
        let agent = sample_agent();
        let document_store = Arc::new(FakeDocumentStore { applied: Mutex::new(vec![]) });
        let (deps, ledger, queue) = deps_with(FakeModelClient::err(ModelErrorKind::Timeout, "timed out"), document_store);

        let stream = mc_model::WorkItem::stream_name(&agent.id);
        queue.produce(&stream, sample_item(&agent)).await.unwrap();

        // max_retries is 2, permitting max_retries + 1 = 3 delivery attempts
        // (§8 invariant #3): delivery_count 1 and 2 both retry (attempt <=
        // max_retries), delivery_count 3 hits the ceiling and dead-letters.
        let first = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);
        pipeline::process_one(&deps, &agent.id, first).await;
        assert!(ledger.executions.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);
        pipeline::process_one(&deps, &agent.id, second).await;
        assert!(ledger.executions.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let third = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);
        pipeline::process_one(&deps, &agent.id, third).await;

        let executions = ledger.executions.lock();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, mc_model::ExecutionStatus::Dlq);
        assert_eq!(queue.pending_count(&stream, "workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn model_4xx_goes_straight_to_dlq() {
        let agent = sample_agent();
        let document_store = Arc::new(FakeDocumentStore { applied: Mutex::new(vec![]) });
        let (deps, ledger, queue) = deps_with(FakeModelClient::err(ModelErrorKind::ClientError, "bad request"), document_store);

        let stream = mc_model::WorkItem::stream_name(&agent.id);
        queue.produce(&stream, sample_item(&agent)).await.unwrap();
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);

        pipeline::process_one(&deps, &agent.id, delivery).await;

        let executions = ledger.executions.lock();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, mc_model::ExecutionStatus::Dlq);
        assert_eq!(queue.pending_count(&stream, "workers").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn agent_deleted_between_enqueue_and_claim_is_skipped() {
        let agent = sample_agent();
        let document_store = Arc::new(FakeDocumentStore { applied: Mutex::new(vec![]) });
        let (deps, ledger, queue) = deps_with(FakeModelClient::ok(ModelResponse { text: "x".to_string(), tokens_used: 1, cost_usd: 0.0 }), document_store);

        let stream = mc_model::WorkItem::stream_name(&agent.id);
        queue.produce(&stream, sample_item(&agent)).await.unwrap();
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap().remove(0);

        // Unknown agent id: the deps' InMemoryAgentStore never had it upserted.
        pipeline::process_one(&deps, "nonexistent", delivery).await;

        let executions = ledger.executions.lock();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, mc_model::ExecutionStatus::Skipped);
        assert_eq!(executions[0].lifecycle_state, "agent_gone");
    }
}
