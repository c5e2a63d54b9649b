use chrono::{DateTime, Utc};
use mc_model::agent::Operation;
use mc_model::{Agent, Disposition, ErrorTag, Execution, IdempotencyRecord, WorkItem};
use mc_queue::{Delivery, KeyValueStream};
use mc_store::{AgentStore, ExecutionLedger, IdempotencyStore, MetricsSink, ModelClient, ModelMessage, ModelRequest, StoreError};
use mc_write::WriteRequest;
use serde_json::Value;
use tracing::{debug, warn};

use crate::classify;
use crate::WorkerDeps;

fn operation_str(op: Operation) -> &'static str {
    match op {
        Operation::Insert => "insert",
        Operation::Update => "update",
        Operation::Replace => "replace",
        Operation::Delete => "delete",
    }
}

/// Run one delivered `WorkItem` through the full per-item pipeline (§4.4).
/// `delivery.delivery_count` is the authoritative attempt number — it is the
/// queue's own redelivery counter, incremented on every `consume()` the
/// entry survives to, which is exactly what "attempt" means for retry/DLQ
/// decisions (the item's own `attempt` field only reflects the dispatcher's
/// initial value at enqueue time).
pub async fn process_one(deps: &WorkerDeps, agent_id: &str, delivery: Delivery) {
    let stream = WorkItem::stream_name(agent_id);
    let group = "workers";
    let item = delivery.item.clone();
    let attempt = delivery.delivery_count;
    let started_at = Utc::now();

    let agent = match deps.agent_store.get(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            finalize_terminal(deps, &stream, group, &delivery, agent_id, &item, attempt, started_at, ErrorTag::AgentGone, "agent no longer exists").await;
            return;
        }
        Err(e) => {
            warn!(agent_id, error = %e, "failed to load agent, nacking without attempt");
            let _ = deps.queue.nack(&stream, group, &delivery.item_id, 1_000).await;
            return;
        }
    };

    match deps.idempotency.get(&item.idempotency_key).await {
        Ok(Some(_)) => {
            debug!(agent_id, document_id = %item.document_id, "idempotent replay, skipping");
            let execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent.id.clone(), item.document_id.clone(), attempt, started_at)
                .finish_skipped(Utc::now(), "idempotent_replay".to_string());
            let _ = deps.ledger.record(&execution).await;
            let _ = deps.queue.ack(&stream, group, &delivery.item_id).await;
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(agent_id, error = %e, "idempotency lookup failed, nacking without attempt");
            let _ = deps.queue.nack(&stream, group, &delivery.item_id, 1_000).await;
            return;
        }
    }

    if let Err(denial) = deps.admission.check(&agent.id, &agent.ai.provider, &agent.ai.model, agent.execution.rate_limit_per_minute, agent.execution.cost_limit_usd_per_hour) {
        let delay_ms = mc_resilience::admission_retry_delay_ms(agent.execution.retry_delay_ms, attempt);
        debug!(agent_id, ?denial, delay_ms, "admission denied, nacking without attempt");
        let _ = deps.queue.nack(&stream, group, &delivery.item_id, delay_ms).await;
        return;
    }

    let ctx = mc_expr::Context::new(item.document.clone(), serde_json::to_value(&agent).unwrap_or(Value::Null), operation_str(item.operation), started_at);

    let prompt = match agent.ai.prompt.render(&ctx) {
        Ok(p) => p,
        Err(e) => {
            finalize_terminal(deps, &stream, group, &delivery, agent_id, &item, attempt, started_at, ErrorTag::ConfigurationError, &e.to_string()).await;
            return;
        }
    };
    let system_prompt = match agent.ai.system_prompt.as_ref().map(|t| t.render(&ctx)) {
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => {
            finalize_terminal(deps, &stream, group, &delivery, agent_id, &item, attempt, started_at, ErrorTag::ConfigurationError, &e.to_string()).await;
            return;
        }
        None => None,
    };

    let mut messages = Vec::with_capacity(2);
    if let Some(system_prompt) = system_prompt {
        messages.push(ModelMessage { role: "system".to_string(), content: system_prompt });
    }
    messages.push(ModelMessage { role: "user".to_string(), content: prompt });

    let request = ModelRequest {
        provider: agent.ai.provider.clone(),
        model: agent.ai.model.clone(),
        messages,
        temperature: agent.ai.temperature,
        max_tokens: agent.ai.max_tokens,
        timeout_ms: agent.execution.timeout_ms,
    };

    let response = match deps.model_client.invoke(request).await {
        Ok(r) => r,
        Err(StoreError::Model(model_err)) => {
            deps.admission.record_outcome(&agent.id, &agent.ai.provider, &agent.ai.model, false, 0.0);
            let tag = classify::model_error_tag(model_err.kind);
            handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, tag, &model_err.message).await;
            return;
        }
        Err(other) => {
            deps.admission.record_outcome(&agent.id, &agent.ai.provider, &agent.ai.model, false, 0.0);
            handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, ErrorTag::Model5xx, &other.to_string()).await;
            return;
        }
    };

    deps.admission.record_outcome(&agent.id, &agent.ai.provider, &agent.ai.model, true, response.cost_usd);

    let value = match &agent.ai.response_schema {
        Some(schema) => match serde_json::from_str::<Value>(&response.text) {
            Ok(parsed) => match classify::validate_against_schema(schema, &parsed) {
                Ok(()) => parsed,
                Err(message) => {
                    handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, ErrorTag::ParseError, &message).await;
                    return;
                }
            },
            Err(e) => {
                handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, ErrorTag::ParseError, &e.to_string()).await;
                return;
            }
        },
        None => Value::String(response.text.clone()),
    };

    let live_agent_revision = Some(agent.revision);
    let write_request = WriteRequest {
        database: agent.watch.database.clone(),
        collection: agent.watch.collection.clone(),
        document_id: item.document_id.clone(),
        strategy: agent.write.strategy,
        target_field: agent.write.target_field.clone(),
        value,
        idempotency_key: item.idempotency_key.clone(),
        include_metadata: agent.write.include_metadata,
        agent_id: agent.id.clone(),
        agent_revision: item.agent_revision,
        executed_at: Utc::now(),
        live_agent_revision,
    };

    match deps.write_engine.write(write_request).await {
        Ok(outcome) => {
            let execution_id = uuid::Uuid::new_v4().to_string();
            let record = IdempotencyRecord {
                key: item.idempotency_key.clone(),
                executed_at: Utc::now(),
                execution_id: execution_id.clone(),
                result_fingerprint: outcome.result_fingerprint,
            };
            if let Err(e) = deps.idempotency.set_if_absent(&record).await {
                warn!(agent_id = %agent.id, error = %e, "failed to record idempotency entry after a successful write");
            }

            let mut execution = Execution::started(execution_id, agent.id.clone(), item.document_id.clone(), attempt, started_at)
                .finish_completed(Utc::now(), outcome.written, Some(response.tokens_used), Some(response.cost_usd));
            if outcome.stale_agent {
                execution.lifecycle_state = "stale_agent".to_string();
            }
            let duration_secs = execution.duration_ms.unwrap_or(0) as f64 / 1000.0;
            if let Err(e) = deps.ledger.record(&execution).await {
                warn!(agent_id = %agent.id, error = %e, "failed to record completed execution");
            }
            deps.metrics.histogram_observe("mongoclaw_agent_latency_seconds", vec![("agent_id", agent.id.clone())], duration_secs);
            deps.metrics.histogram_observe("mongoclaw_model_cost_usd", vec![("agent_id", agent.id.clone())], response.cost_usd);
            deps.metrics.counter_inc("mongoclaw_executions_completed_total", vec![("agent_id", agent.id.clone())], 1);
            if deps.admission.slo.record(&agent.id, duration_secs) {
                deps.metrics.counter_inc("mongoclaw_agent_latency_slo_violations_total", vec![("agent_id", agent.id.clone())], 1);
            }

            if let Err(e) = deps.queue.ack(&stream, group, &delivery.item_id).await {
                warn!(agent_id = %agent.id, error = %e, "failed to ack after a successful write");
            }
        }
        Err(mc_write::WriteError::DocumentMissing(_)) => {
            handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, ErrorTag::TransientWriteError, "source document no longer exists").await;
        }
        Err(other) => {
            handle_error(deps, &stream, group, &delivery, &agent, &item, attempt, started_at, ErrorTag::TransientWriteError, &other.to_string()).await;
        }
    }
}

/// Apply `tag`'s fixed disposition (§7) to an in-flight item: ack-and-skip,
/// retry with backoff, retry with an elongated schedule, or go straight to
/// the dead-letter queue once `max_retries` is exhausted.
async fn handle_error(
    deps: &WorkerDeps,
    stream: &str,
    group: &str,
    delivery: &Delivery,
    agent: &Agent,
    item: &WorkItem,
    attempt: u32,
    started_at: DateTime<Utc>,
    tag: ErrorTag,
    message: &str,
) {
    match tag.disposition() {
        Disposition::Skip => finalize_skip(deps, stream, group, delivery, agent, item, attempt, started_at, tag, message).await,
        Disposition::CompletedNoop => {
            let execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent.id.clone(), item.document_id.clone(), attempt, started_at)
                .finish_completed(Utc::now(), false, None, None);
            let _ = deps.ledger.record(&execution).await;
            let _ = deps.queue.ack(stream, group, &delivery.item_id).await;
        }
        Disposition::NackNoAttempt => {
            let delay_ms = mc_resilience::admission_retry_delay_ms(agent.execution.retry_delay_ms, attempt);
            let _ = deps.queue.nack(stream, group, &delivery.item_id, delay_ms).await;
        }
        Disposition::DlqDirect => send_to_dlq(deps, stream, group, delivery, agent, item, attempt, started_at, tag, message).await,
        Disposition::RetryThenDlq => {
            retry_or_dlq(deps, stream, group, delivery, agent, item, attempt, started_at, tag, message, agent.execution.retry_delay_ms).await
        }
        Disposition::RetryElongated => {
            // Rate-limited responses get a coarser backoff than ordinary
            // transient failures so a single hot agent doesn't hammer the
            // provider's rate limit window on every attempt.
            retry_or_dlq(deps, stream, group, delivery, agent, item, attempt, started_at, tag, message, agent.execution.retry_delay_ms.saturating_mul(4)).await
        }
    }
}

async fn retry_or_dlq(
    deps: &WorkerDeps,
    stream: &str,
    group: &str,
    delivery: &Delivery,
    agent: &Agent,
    item: &WorkItem,
    attempt: u32,
    started_at: DateTime<Utc>,
    tag: ErrorTag,
    message: &str,
    base_delay_ms: u64,
) {
    if attempt <= agent.execution.max_retries {
        let delay_ms = mc_common::exponential_backoff_ms(base_delay_ms, attempt.saturating_sub(1), 60_000);
        debug!(agent_id = %agent.id, attempt, delay_ms, ?tag, "retrying after backoff");
        deps.metrics.counter_inc("mongoclaw_retries_scheduled_total", vec![("agent_id", agent.id.clone())], 1);
        let _ = deps.queue.nack(stream, group, &delivery.item_id, delay_ms).await;
    } else {
        send_to_dlq(deps, stream, group, delivery, agent, item, attempt, started_at, tag, message).await;
    }
}

async fn send_to_dlq(
    deps: &WorkerDeps,
    stream: &str,
    group: &str,
    delivery: &Delivery,
    agent: &Agent,
    item: &WorkItem,
    attempt: u32,
    started_at: DateTime<Utc>,
    tag: ErrorTag,
    message: &str,
) {
    deps.admission.record_dlq(&agent.id);
    let execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent.id.clone(), item.document_id.clone(), attempt, started_at)
        .finish_dlq(Utc::now(), tag, message.to_string());
    if let Err(e) = deps.ledger.record(&execution).await {
        warn!(agent_id = %agent.id, error = %e, "failed to record dlq execution");
    }
    deps.metrics.counter_inc("mongoclaw_executions_dlq_total", vec![("agent_id", agent.id.clone())], 1);
    if let Err(e) = deps.queue.dlq_push(&agent.id, item.clone(), message).await {
        warn!(agent_id = %agent.id, error = %e, "failed to push to dead-letter queue");
    }
    if let Err(e) = deps.queue.ack(stream, group, &delivery.item_id).await {
        warn!(agent_id = %agent.id, error = %e, "failed to ack after dead-lettering");
    }
}

async fn finalize_skip(
    deps: &WorkerDeps,
    stream: &str,
    group: &str,
    delivery: &Delivery,
    agent: &Agent,
    item: &WorkItem,
    attempt: u32,
    started_at: DateTime<Utc>,
    tag: ErrorTag,
    message: &str,
) {
    let mut execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent.id.clone(), item.document_id.clone(), attempt, started_at)
        .finish_skipped(Utc::now(), tag_label(tag));
    execution.error = Some(mc_model::ExecutionError { tag, message: message.to_string() });
    let _ = deps.ledger.record(&execution).await;
    let _ = deps.queue.ack(stream, group, &delivery.item_id).await;
}

/// Like `finalize_skip` but for failures discovered before the agent is even
/// resolved (`agent_gone`) — takes the bare `agent_id` rather than a loaded
/// `Agent`, since none is available.
async fn finalize_terminal(
    deps: &WorkerDeps,
    stream: &str,
    group: &str,
    delivery: &Delivery,
    agent_id: &str,
    item: &WorkItem,
    attempt: u32,
    started_at: DateTime<Utc>,
    tag: ErrorTag,
    message: &str,
) {
    let mut execution = Execution::started(uuid::Uuid::new_v4().to_string(), agent_id.to_string(), item.document_id.clone(), attempt, started_at)
        .finish_skipped(Utc::now(), tag_label(tag));
    execution.error = Some(mc_model::ExecutionError { tag, message: message.to_string() });
    let _ = deps.ledger.record(&execution).await;
    let _ = deps.queue.ack(stream, group, &delivery.item_id).await;
}

fn tag_label(tag: ErrorTag) -> String {
    match tag {
        ErrorTag::ConfigurationError => "configuration_error",
        ErrorTag::FilterError => "filter_error",
        ErrorTag::AgentGone => "agent_gone",
        other => unreachable!("tag_label called for a non-skip disposition: {other:?}"),
    }
    .to_string()
}
