//! Dispatcher (§4.2): fans each `ChangeEvent` out to zero or more
//! `WorkItem`s, one per matching enabled agent, and only acknowledges the
//! event to the watcher once every enqueue has succeeded.

mod loop_guard;
mod matcher;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mc_model::agent::Operation;
use mc_model::{Agent, ChangeEvent, ErrorTag, Execution, ExecutionError, Trigger, WorkItem};
use mc_queue::{KeyValueStream, QueueError};
use mc_store::{AgentChange, AgentStore, ExecutionLedger, MetricsSink};
use mc_watcher::WatcherSupervisor;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

fn operation_str(op: Operation) -> &'static str {
    match op {
        Operation::Insert => "insert",
        Operation::Update => "update",
        Operation::Replace => "replace",
        Operation::Delete => "delete",
    }
}

/// Holds a live snapshot of enabled agents (kept fresh off `AgentStore`'s
/// change feed) and fans events out against it.
pub struct Dispatcher {
    agents: DashMap<String, Agent>,
    queue: Arc<dyn KeyValueStream>,
    ledger: Arc<dyn ExecutionLedger>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn KeyValueStream>, ledger: Arc<dyn ExecutionLedger>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { agents: DashMap::new(), queue, ledger, metrics }
    }

    /// Load the initial enabled-agent snapshot. Call once at startup before
    /// `run`/`run_cache_sync`.
    pub async fn hydrate(&self, agent_store: &dyn AgentStore) -> mc_store::Result<()> {
        for agent in agent_store.list_enabled().await? {
            self.agents.insert(agent.id.clone(), agent);
        }
        Ok(())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Keeps the in-memory agent cache in sync with the `AgentStore`'s
    /// change feed for the lifetime of the process (§3 "Lifecycle").
    pub async fn run_cache_sync(self: Arc<Self>, agent_store: Arc<dyn AgentStore>, mut shutdown: broadcast::Receiver<()>) {
        use futures::StreamExt;

        let mut changes = match agent_store.subscribe_changes().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to subscribe to agent changes, cache will go stale");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("agent cache sync stopping");
                    return;
                }
                change = changes.next() => {
                    match change {
                        Some(AgentChange::Deleted(id)) => {
                            self.agents.remove(&id);
                        }
                        Some(AgentChange::Created(id)) | Some(AgentChange::Updated(id)) => {
                            match agent_store.get(&id).await {
                                Ok(Some(agent)) if agent.enabled => {
                                    self.agents.insert(id, agent);
                                }
                                Ok(_) => {
                                    self.agents.remove(&id);
                                }
                                Err(e) => warn!(agent_id = %id, error = %e, "failed to refresh agent cache entry"),
                            }
                        }
                        None => {
                            warn!("agent change feed ended, cache will go stale");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Consume `ChangeEvent`s from the watcher handoff, dispatching each and
    /// acking its sequence only after every matched agent's enqueue succeeds.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>, supervisor: Arc<Mutex<WatcherSupervisor>>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("dispatcher stopping");
                    return;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("watcher handoff closed, dispatcher stopping");
                        return;
                    };
                    self.dispatch_one(event, &supervisor).await;
                }
            }
        }
    }

    async fn dispatch_one(&self, event: ChangeEvent, supervisor: &Arc<Mutex<WatcherSupervisor>>) {
        let mut attempt: u32 = 0;
        loop {
            match self.try_fan_out(&event).await {
                Ok(()) => {
                    supervisor.lock().await.ack(&event.watcher_id, event.sequence);
                    return;
                }
                Err(DispatchError::Queue(e)) => {
                    let delay_ms = mc_common::exponential_backoff_ms(500, attempt, 30_000);
                    warn!(watcher_id = %event.watcher_id, sequence = event.sequence, error = %e, delay_ms, "queue enqueue failed, retrying without acking");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Fan `event` out to every currently matching agent. Must leave the
    /// event unacked on the first queue error so the watcher replays it —
    /// duplicate enqueues to agents that already succeeded are tolerated by
    /// the idempotency layer (§4.2 "Enqueue").
    async fn try_fan_out(&self, event: &ChangeEvent) -> Result<(), DispatchError> {
        for entry in self.agents.iter() {
            let agent = entry.value();

            match matcher::matches(event, agent) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.record_skip(event, agent, "configuration_error", &e.to_string()).await;
                    continue;
                }
            }

            let ctx = mc_expr::Context::new(
                event.full_document.clone().unwrap_or(Value::Null),
                serde_json::to_value(agent).unwrap_or(Value::Null),
                operation_str(event.operation),
                event.cluster_time,
            );
            let idempotency_key = match agent.write.idempotency_key.render(&ctx) {
                Ok(k) => k,
                Err(e) => {
                    self.record_skip(event, agent, "configuration_error", &e.to_string()).await;
                    continue;
                }
            };

            if loop_guard::is_self_triggered(event, agent, &idempotency_key) {
                debug!(agent_id = %agent.id, document_id = %event.document_id, "loop guard skipped self-triggered event");
                self.metrics.counter_inc("mongoclaw_loop_guard_skips_total", vec![("agent_id", agent.id.clone())], 1);
                self.record_skip(event, agent, "loop_guard_skipped", "event echoes this agent's own prior write").await;
                continue;
            }

            let item = WorkItem {
                item_id: None,
                agent_id: agent.id.clone(),
                agent_revision: agent.revision,
                document_id: event.document_id.clone(),
                document: event.full_document.clone().unwrap_or(Value::Null),
                operation: event.operation,
                enqueued_at: Utc::now(),
                attempt: 1,
                trigger: Trigger::Change,
                idempotency_key,
            };

            self.queue.produce(&WorkItem::stream_name(&agent.id), item).await?;
        }
        Ok(())
    }

    async fn record_skip(&self, event: &ChangeEvent, agent: &Agent, reason: &str, detail: &str) {
        let mut execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent.id.clone(), event.document_id.clone(), 0, Utc::now())
            .finish_skipped(Utc::now(), reason.to_string());
        if reason == "configuration_error" {
            execution.error = Some(ExecutionError { tag: ErrorTag::ConfigurationError, message: detail.to_string() });
        }
        if let Err(e) = self.ledger.record(&execution).await {
            warn!(agent_id = %agent.id, error = %e, "failed to record skipped execution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mc_expr::Template;
    use mc_model::agent::{AiSpec, ConsistencyMode, ExecutionSpec, WatchSpec, WriteSpec, WriteStrategy};
    use mc_queue::InMemoryKeyValueStream;
    use mc_store::NullMetricsSink;
    use parking_lot::Mutex;

    fn agent(id: &str, revision: u64) -> Agent {
        Agent {
            id: id.to_string(),
            name: "Classify".to_string(),
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
                prompt: Template::parse("hi").unwrap(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 16,
                response_schema: None,
            },
            write: WriteSpec {
                strategy: WriteStrategy::Merge,
                target_field: "classification".to_string(),
                idempotency_key: Template::parse("{{document._id}}-{{agent.id}}-{{agent.revision}}").unwrap(),
                include_metadata: true,
            },
            execution: ExecutionSpec {
                max_retries: 3,
                retry_delay_ms: 1000,
                timeout_ms: 30_000,
                rate_limit_per_minute: 60,
                cost_limit_usd_per_hour: 10.0,
                consistency_mode: ConsistencyMode::Eventual,
            },
            revision,
        }
    }

    fn event(full_document: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            watcher_id: "support:tickets".to_string(),
            resume_token: "tok".to_string(),
            sequence: 0,
            operation: Operation::Insert,
            database: "support".to_string(),
            collection: "tickets".to_string(),
            document_id: "t1".to_string(),
            full_document,
            cluster_time: Utc::now(),
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

    #[tokio::test]
    async fn matching_event_enqueues_work_item() {
        let queue = Arc::new(InMemoryKeyValueStream::new());
        let ledger = Arc::new(FakeLedger::default());
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), ledger.clone(), Arc::new(NullMetricsSink)));
        dispatcher.agents.insert("classify".to_string(), agent("classify", 1));

        dispatcher.try_fan_out(&event(Some(serde_json::json!({"_id": "t1"})))).await.unwrap();

        let stream = WorkItem::stream_name("classify");
        assert_eq!(queue.pending_count(&stream, "workers").await.unwrap(), 0);
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap();
        assert_eq!(delivery.len(), 1);
        assert_eq!(delivery[0].item.document_id, "t1");
    }

    #[tokio::test]
    async fn self_triggered_echo_is_skipped_without_enqueue() {
        let queue = Arc::new(InMemoryKeyValueStream::new());
        let ledger = Arc::new(FakeLedger::default());
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), ledger.clone(), Arc::new(NullMetricsSink)));
        dispatcher.agents.insert("classify".to_string(), agent("classify", 1));

        let echo = serde_json::json!({
            "_id": "t1",
            "classification": {"agentRevision": 1, "idempotencyKey": "t1-classify-1"},
        });
        dispatcher.try_fan_out(&event(Some(echo))).await.unwrap();

        let stream = WorkItem::stream_name("classify");
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap();
        assert!(delivery.is_empty());
        assert_eq!(ledger.executions.lock().len(), 1);
        assert_eq!(ledger.executions.lock()[0].lifecycle_state, "loop_guard_skipped");
    }

    #[tokio::test]
    async fn non_matching_collection_is_ignored() {
        let queue = Arc::new(InMemoryKeyValueStream::new());
        let ledger = Arc::new(FakeLedger::default());
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), ledger.clone(), Arc::new(NullMetricsSink)));
        let mut other = agent("classify", 1);
        other.watch.collection = "orders".to_string();
        dispatcher.agents.insert("classify".to_string(), other);

        dispatcher.try_fan_out(&event(Some(serde_json::json!({"_id": "t1"})))).await.unwrap();

        let stream = WorkItem::stream_name("classify");
        let delivery = queue.consume(&stream, "workers", "w1", 10, 0).await.unwrap();
        assert!(delivery.is_empty());
        assert!(ledger.executions.lock().is_empty());
    }
}
