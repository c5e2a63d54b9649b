//! MongoClaw monolith binary: loads config, connects to Mongo/Redis, starts
//! the runtime, and serves a minimal status/metrics surface.
//!
//! Grounded on `fc-dev::main.rs`'s shape (CLI parse, shutdown broadcast,
//! axum metrics server, ctrl_c/SIGTERM shutdown_signal), trimmed to the
//! core pipeline plus the thin ops surface named in spec §6 — no REST
//! management API, no auth, no outbox, no platform services.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use mc_config::{Cli, ModelConfig};
use mc_metrics::PrometheusMetricsSink;
use mc_runtime::{Runtime, RuntimeDeps, StatusHandle};
use mc_store::{HttpModelClient, MongoAgentStore, MongoDocumentStore, MongoExecutionLedger, MongoIdempotencyStore, MongoResumeTokenStore};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Clone)]
struct StatusState {
    status: StatusHandle,
    metrics: Arc<PrometheusMetricsSink>,
    shutdown_tx: broadcast::Sender<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve()?;

    mc_common::init_tracing(config.runtime.json_logs);
    info!("starting MongoClaw");

    let mongo_client = mongodb::Client::with_uri_str(&config.store.mongo_uri).await?;
    info!(database = %config.store.control_database, "connected to MongoDB");

    let agent_store = Arc::new(MongoAgentStore::new(&mongo_client, &config.store.control_database));
    let document_store = Arc::new(MongoDocumentStore::new(mongo_client.clone()));
    let resume_store = Arc::new(MongoResumeTokenStore::new(&mongo_client, &config.store.control_database));
    let ledger = Arc::new(MongoExecutionLedger::new(&mongo_client, &config.store.control_database));
    let idempotency = Arc::new(MongoIdempotencyStore::new(&mongo_client, &config.store.control_database));

    let queue = Arc::new(mc_queue::RedisKeyValueStream::connect(&config.queue.redis_url).await?);
    info!("connected to Redis");

    let model_client = Arc::new(build_model_client(&config.model));
    let metrics = Arc::new(PrometheusMetricsSink::install()?);

    let deps = RuntimeDeps {
        agent_store,
        document_store,
        resume_store,
        queue,
        ledger,
        idempotency,
        model_client,
        metrics: metrics.clone(),
    };
    let runtime = Runtime::new(deps, &config.runtime);
    let status = runtime.status_handle();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let status_state = StatusState { status, metrics, shutdown_tx: shutdown_tx.clone() };
    let status_app = Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/drain", post(drain_handler))
        .with_state(status_state);

    let status_listener = TcpListener::bind(&config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "status/metrics server listening");
    let status_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(status_listener, status_app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("status server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("status server shutting down");
                }
            }
        })
    };

    let runtime_handle = tokio::spawn(runtime.run(shutdown_tx.subscribe()));

    info!("MongoClaw started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received, initiating graceful shutdown");
    let _ = shutdown_tx.send(());

    let _ = runtime_handle.await;
    let _ = status_handle.await;
    info!("MongoClaw shutdown complete");
    Ok(())
}

fn build_model_client(config: &ModelConfig) -> HttpModelClient {
    let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
    HttpModelClient::new(config.base_url.clone(), api_key, config.cost_per_1k_tokens)
}

async fn status_handler(State(state): State<StatusState>) -> Json<serde_json::Value> {
    match state.status.status().await {
        Ok(statuses) => {
            let map: serde_json::Map<String, serde_json::Value> = statuses
                .into_iter()
                .map(|(id, s)| {
                    let value = serde_json::json!({
                        "enabled": s.enabled,
                        "queueDepth": s.queue_depth,
                        "dlqDepth": s.dlq_depth,
                        "breakerState": format!("{:?}", s.breaker_state),
                        "lastExecutionAt": s.last_execution_at,
                    });
                    (id, value)
                })
                .collect();
            Json(serde_json::Value::Object(map))
        }
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn metrics_handler(State(state): State<StatusState>) -> String {
    state.metrics.render()
}

/// Triggers the same broadcast the OS signal handler would, for an
/// operator-initiated graceful drain (§5 "Cancellation": `drain()`).
async fn drain_handler(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let _ = state.shutdown_tx.send(());
    Json(serde_json::json!({ "status": "draining" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
