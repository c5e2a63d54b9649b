//! Change watcher (§4.1): one subscription per watched `(database,
//! collection)`, handed off to the dispatcher via a sequence-tagged,
//! bounded channel. Resume tokens are persisted only after the dispatcher
//! acknowledges an event's full fan-out — see `sequence::SequenceTracker`.

mod sequence;
mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use mc_model::{Agent, ChangeEvent};
use mc_store::{AgentStore, DocumentStore, ResumeTokenStore};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

pub use sequence::SequenceTracker;
pub use subscription::{desired_collections, watcher_id};

struct ActiveSubscription {
    ack_tx: mpsc::UnboundedSender<u64>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the set of live subscriptions and reconciles it against the agents
/// currently enabled in the `AgentStore` (§4.1 "Membership changes").
pub struct WatcherSupervisor {
    document_store: Arc<dyn DocumentStore>,
    resume_store: Arc<dyn ResumeTokenStore>,
    handoff: mpsc::Sender<ChangeEvent>,
    active: HashMap<(String, String), ActiveSubscription>,
}

impl WatcherSupervisor {
    pub fn new(document_store: Arc<dyn DocumentStore>, resume_store: Arc<dyn ResumeTokenStore>, handoff: mpsc::Sender<ChangeEvent>) -> Self {
        Self { document_store, resume_store, handoff, active: HashMap::new() }
    }

    /// Acknowledge `sequence` on the subscription identified by `watcher_id`,
    /// letting its `SequenceTracker` advance the durable resume token.
    pub fn ack(&self, watcher_id: &str, sequence: u64) {
        let found = self.active.iter().find(|(key, _)| subscription::watcher_id(&key.0, &key.1) == watcher_id);
        if let Some((_, sub)) = found {
            let _ = sub.ack_tx.send(sequence);
        }
    }

    /// Diff `desired` against the active set: spawn subscriptions for new
    /// `(database, collection)` pairs, drain and stop orphaned ones.
    pub async fn reconcile(&mut self, desired: std::collections::HashSet<(String, String)>) {
        let to_stop: Vec<(String, String)> = self.active.keys().filter(|k| !desired.contains(*k)).cloned().collect();
        for key in to_stop {
            if let Some(sub) = self.active.remove(&key) {
                info!(database = %key.0, collection = %key.1, "stopping orphaned subscription");
                let _ = sub.shutdown_tx.send(());
                let _ = sub.task.await;
            }
        }

        for key in desired {
            if self.active.contains_key(&key) {
                continue;
            }
            let (database, collection) = key.clone();
            info!(%database, %collection, "starting subscription");
            let (ack_tx, ack_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let store = self.document_store.clone();
            let resume_store = self.resume_store.clone();
            let handoff = self.handoff.clone();
            let task = tokio::spawn(subscription::run_subscription(
                database.clone(),
                collection.clone(),
                store,
                resume_store,
                handoff,
                ack_rx,
                shutdown_rx,
            ));
            self.active.insert(key, ActiveSubscription { ack_tx, shutdown_tx, task });
        }
    }

    /// Stop every active subscription, draining in place (§5 shutdown).
    pub async fn shutdown(&mut self) {
        for (_, sub) in self.active.drain() {
            let _ = sub.shutdown_tx.send(());
            let _ = sub.task.await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Runs the reconciliation loop every `interval`: lists enabled agents,
/// derives the desired `(database, collection)` set, and reconciles it
/// against the live subscriptions (§4.1, default `R` = 5s).
pub async fn run_reconciliation_loop(
    supervisor: Arc<tokio::sync::Mutex<WatcherSupervisor>>,
    agent_store: Arc<dyn AgentStore>,
    interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match agent_store.list_enabled().await {
                    Ok(agents) => {
                        let desired = desired_collections(&agents);
                        supervisor.lock().await.reconcile(desired).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to list enabled agents during reconciliation");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("reconciliation loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(db: &str, coll: &str) -> Agent {
        Agent {
            id: format!("{db}-{coll}"),
            name: "test".to_string(),
            enabled: true,
            tags: vec![],
            watch: mc_model::agent::WatchSpec {
                database: db.to_string(),
                collection: coll.to_string(),
                operations: vec![mc_model::agent::Operation::Insert],
                filter: serde_json::Value::Null,
            },
            ai: mc_model::agent::AiSpec {
                provider: "anthropic".to_string(),
                model: "claude".to_string(),
                prompt: mc_expr::Template::parse("hi").unwrap(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 16,
                response_schema: None,
            },
            write: mc_model::agent::WriteSpec {
                strategy: mc_model::agent::WriteStrategy::Merge,
                target_field: "result".to_string(),
                idempotency_key: mc_expr::Template::parse("k").unwrap(),
                include_metadata: true,
            },
            execution: mc_model::agent::ExecutionSpec {
                max_retries: 3,
                retry_delay_ms: 1000,
                timeout_ms: 30_000,
                rate_limit_per_minute: 60,
                cost_limit_usd_per_hour: 10.0,
                consistency_mode: mc_model::agent::ConsistencyMode::Eventual,
            },
            revision: 1,
        }
    }

    #[test]
    fn desired_collections_dedupes_across_agents() {
        let agents = vec![sample_agent("support", "tickets"), sample_agent("support", "tickets"), sample_agent("sales", "leads")];
        let desired = desired_collections(&agents);
        assert_eq!(desired.len(), 2);
        assert!(desired.contains(&("support".to_string(), "tickets".to_string())));
    }
}
