use std::sync::Arc;
use std::time::Duration;

use mc_model::WorkItem;
use mc_queue::KeyValueStream;
use mc_resilience::{AdmissionGate, BreakerState};
use mc_store::{AgentStore, MetricsSink};
use tokio::sync::broadcast;
use tracing::warn;

/// Periodically samples per-agent queue depth, DLQ depth, quarantine, and
/// breaker state into the gauges named in §6 — the counters/histograms
/// emitted inline by the dispatcher/worker are not this pump's concern.
pub struct MetricsPump {
    metrics: Arc<dyn MetricsSink>,
    queue: Arc<dyn KeyValueStream>,
    agent_store: Arc<dyn AgentStore>,
    admission: Arc<AdmissionGate>,
    interval: Duration,
}

impl MetricsPump {
    pub fn new(metrics: Arc<dyn MetricsSink>, queue: Arc<dyn KeyValueStream>, agent_store: Arc<dyn AgentStore>, admission: Arc<AdmissionGate>, interval: Duration) -> Self {
        Self { metrics, queue, agent_store, admission, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let agents = match self.agent_store.list_enabled().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "metrics pump failed to list enabled agents");
                return;
            }
        };

        for agent in agents {
            let labels = vec![("agent_id", agent.id.clone())];
            let stream = WorkItem::stream_name(&agent.id);

            match self.queue.pending_count(&stream, "workers").await {
                Ok(pending) => self.metrics.gauge_set("mongoclaw_queue_pending", labels.clone(), pending as f64),
                Err(e) => warn!(agent_id = %agent.id, error = %e, "failed to sample queue_pending"),
            }

            match self.queue.dlq_depth(&agent.id).await {
                Ok(depth) => self.metrics.gauge_set("mongoclaw_dlq_size", labels.clone(), depth as f64),
                Err(e) => warn!(agent_id = %agent.id, error = %e, "failed to sample dlq_size"),
            }

            let quarantined = self.admission.quarantine.is_quarantined(&agent.id);
            self.metrics.gauge_set("mongoclaw_quarantine_active", labels.clone(), if quarantined { 1.0 } else { 0.0 });

            let state = self.admission.breakers.state(&agent.id, &agent.ai.provider, &agent.ai.model);
            let numeric = match state {
                BreakerState::Closed => 0.0,
                BreakerState::HalfOpen => 1.0,
                BreakerState::Open => 2.0,
            };
            self.metrics.gauge_set("mongoclaw_circuit_breaker_state", labels, numeric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_expr::Template;
    use mc_model::agent::{AiSpec, ConsistencyMode, ExecutionSpec, Operation, WatchSpec, WriteSpec, WriteStrategy};
    use mc_model::Agent;
    use mc_queue::InMemoryKeyValueStream;
    use mc_store::{InMemoryAgentStore, NullMetricsSink};

    fn sample_agent() -> Agent {
        Agent {
            id: "classify".to_string(),
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
                idempotency_key: Template::parse("k").unwrap(),
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
            revision: 1,
        }
    }

    #[tokio::test]
    async fn tick_samples_every_enabled_agent_without_panicking() {
        let agent_store = Arc::new(InMemoryAgentStore::new());
        agent_store.upsert(sample_agent());

        let pump = MetricsPump::new(
            Arc::new(NullMetricsSink),
            Arc::new(InMemoryKeyValueStream::new()),
            agent_store,
            Arc::new(AdmissionGate::new(20, 30.0)),
            Duration::from_secs(1),
        );
        pump.tick().await;
    }
}
