//! Orchestrator (§5): spawns one subscription task per watched collection,
//! a bounded worker pool, a reconciliation loop, and a metrics pump, all
//! sharing a single `tokio::sync::broadcast` shutdown signal — the same
//! shape as `fc-router::lifecycle::LifecycleManager`, generalized from its
//! five fixed maintenance tasks to this pipeline's four.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mc_config::RuntimeConfig;
use mc_dispatcher::Dispatcher;
use chrono::{DateTime, Utc};
use mc_model::{Agent, ChangeEvent};
use mc_queue::KeyValueStream;
use mc_resilience::AdmissionGate;
use mc_store::{AgentStore, DocumentStore, ExecutionLedger, IdempotencyStore, MetricsSink, ModelClient, ResumeTokenStore};
use mc_watcher::WatcherSupervisor;
use mc_worker::{WorkerDeps, WorkerPool};
use mc_write::WriteEngine;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

/// Every consumed-interface implementation the runtime needs to wire up.
/// Constructing these (Mongo clients, Redis connection, model HTTP client)
/// is the binary's job; this crate only composes them.
pub struct RuntimeDeps {
    pub agent_store: Arc<dyn AgentStore>,
    pub document_store: Arc<dyn DocumentStore>,
    pub resume_store: Arc<dyn ResumeTokenStore>,
    pub queue: Arc<dyn KeyValueStream>,
    pub ledger: Arc<dyn ExecutionLedger>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub model_client: Arc<dyn ModelClient>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Per-agent snapshot for the `/status` surface (§6 `status()`).
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub enabled: bool,
    pub queue_depth: u64,
    pub dlq_depth: u64,
    pub breaker_state: mc_resilience::BreakerState,
    pub last_execution_at: Option<DateTime<Utc>>,
}

/// Cheap-to-clone handle for the `/status` surface, obtained via
/// `Runtime::status_handle` before `run` consumes the runtime — `run`'s
/// subsystems take ownership of their pieces, so status queries need their
/// own references into the shared stores rather than a live view of `Runtime`.
#[derive(Clone)]
pub struct StatusHandle {
    agent_store: Arc<dyn AgentStore>,
    queue: Arc<dyn KeyValueStream>,
    ledger: Arc<dyn ExecutionLedger>,
    admission: Arc<AdmissionGate>,
}

impl StatusHandle {
    /// Per-agent operational snapshot (§6 `status()`).
    pub async fn status(&self) -> mc_store::Result<HashMap<String, AgentStatus>> {
        let mut out = HashMap::new();
        for agent in self.agent_store.list_enabled().await? {
            out.insert(agent.id.clone(), self.agent_status(&agent).await);
        }
        Ok(out)
    }

    async fn agent_status(&self, agent: &Agent) -> AgentStatus {
        let stream = mc_model::WorkItem::stream_name(&agent.id);
        let queue_depth = self.queue.pending_count(&stream, "workers").await.unwrap_or(0);
        let dlq_depth = self.queue.dlq_depth(&agent.id).await.unwrap_or(0);
        let breaker_state = self.admission.breakers.state(&agent.id, &agent.ai.provider, &agent.ai.model);
        let last_execution_at = self
            .ledger
            .recent_for_agent(&agent.id, 1)
            .await
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|e| e.completed_at.unwrap_or(e.started_at));
        AgentStatus { enabled: agent.enabled, queue_depth, dlq_depth, breaker_state, last_execution_at }
    }
}

/// Owns every long-lived task in the pipeline. `new` wires the components
/// together; `run` spawns them and blocks until shutdown completes or the
/// deadline expires.
pub struct Runtime {
    agent_store: Arc<dyn AgentStore>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<Mutex<WatcherSupervisor>>,
    worker_pool: WorkerPool,
    metrics_pump: mc_metrics::MetricsPump,
    status: StatusHandle,
    events_rx: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    reconcile_interval: Duration,
    shutdown_deadline: Duration,
}

impl Runtime {
    pub fn new(deps: RuntimeDeps, config: &RuntimeConfig) -> Self {
        let admission = Arc::new(AdmissionGate::new(config.quarantine_consecutive_dlq, config.slo_target_latency_secs));
        let (handoff_tx, handoff_rx) = mpsc::channel(config.watcher_handoff_depth);

        let supervisor = Arc::new(Mutex::new(WatcherSupervisor::new(deps.document_store.clone(), deps.resume_store.clone(), handoff_tx)));

        let dispatcher = Arc::new(Dispatcher::new(deps.queue.clone(), deps.ledger.clone(), deps.metrics.clone()));

        let write_engine = Arc::new(WriteEngine::new(deps.document_store.clone()));
        let worker_deps = WorkerDeps {
            queue: deps.queue.clone(),
            agent_store: deps.agent_store.clone(),
            model_client: deps.model_client.clone(),
            ledger: deps.ledger.clone(),
            idempotency: deps.idempotency.clone(),
            write_engine,
            admission: admission.clone(),
            metrics: deps.metrics.clone(),
        };
        let worker_pool = WorkerPool::new(worker_deps, config.worker_count, 2_000);

        let metrics_pump = mc_metrics::MetricsPump::new(deps.metrics.clone(), deps.queue.clone(), deps.agent_store.clone(), admission.clone(), Duration::from_secs(10));

        let status = StatusHandle {
            agent_store: deps.agent_store.clone(),
            queue: deps.queue,
            ledger: deps.ledger,
            admission,
        };

        Self {
            agent_store: deps.agent_store,
            dispatcher,
            supervisor,
            worker_pool,
            metrics_pump,
            status,
            events_rx: Mutex::new(Some(handoff_rx)),
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
            shutdown_deadline: Duration::from_secs(config.shutdown_deadline_secs),
        }
    }

    /// Clone out the handle needed to serve `/status` while `run` owns the
    /// rest of the runtime. Call before `run`.
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Spawn every subsystem and block until `shutdown` fires and every task
    /// has either drained or hit the shutdown deadline (§5 "Cancellation").
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.dispatcher.hydrate(self.agent_store.as_ref()).await {
            warn!(error = %e, "failed to hydrate dispatcher agent cache at startup");
        }

        let events_rx = self.events_rx.lock().await.take().expect("Runtime::run called more than once");

        let mut handles = Vec::new();

        handles.push(tokio::spawn(mc_watcher::run_reconciliation_loop(
            self.supervisor.clone(),
            self.agent_store.clone(),
            self.reconcile_interval,
            shutdown.resubscribe(),
        )));

        handles.push(tokio::spawn(self.dispatcher.clone().run_cache_sync(self.agent_store.clone(), shutdown.resubscribe())));

        handles.push(tokio::spawn(self.dispatcher.clone().run(events_rx, self.supervisor.clone(), shutdown.resubscribe())));

        handles.push(tokio::spawn(self.worker_pool.run(shutdown.resubscribe())));

        handles.push(tokio::spawn(self.metrics_pump.run(shutdown.resubscribe())));

        // Block until the signal fires or the sender is dropped.
        let _ = shutdown.recv().await;
        info!("shutdown signal received, draining runtime tasks");

        self.supervisor.lock().await.shutdown().await;

        let drained = tokio::time::timeout(self.shutdown_deadline, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(deadline_secs = self.shutdown_deadline.as_secs(), "shutdown deadline exceeded, forcing exit");
        } else {
            info!("runtime shutdown complete");
        }
    }
}
