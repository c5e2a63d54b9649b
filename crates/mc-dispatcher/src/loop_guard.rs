use mc_model::{Agent, ChangeEvent};
use serde_json::Value;

fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// True if this event is the self-triggered echo of a write this agent
/// already performed — the post-image already carries the envelope this
/// event would itself produce (§4.2 "Loop-guard").
pub fn is_self_triggered(event: &ChangeEvent, agent: &Agent, rendered_idempotency_key: &str) -> bool {
    let Some(doc) = &event.full_document else { return false };
    let Some(envelope) = resolve_path(doc, &agent.write.target_field) else { return false };
    let agent_revision_matches = envelope.get("agentRevision").and_then(Value::as_u64) == Some(agent.revision);
    let key_matches = envelope.get("idempotencyKey").and_then(Value::as_str) == Some(rendered_idempotency_key);
    agent_revision_matches && key_matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_expr::Template;
    use mc_model::agent::{AiSpec, ConsistencyMode, ExecutionSpec, Operation, WatchSpec, WriteSpec, WriteStrategy};

    fn agent() -> Agent {
        Agent {
            id: "classify".to_string(),
            name: "Classify".to_string(),
            enabled: true,
            tags: vec![],
            watch: WatchSpec {
                database: "support".to_string(),
                collection: "tickets".to_string(),
                operations: vec![Operation::Insert, Operation::Update],
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
            revision: 4,
        }
    }

    fn event(full_document: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            watcher_id: "support:tickets".to_string(),
            resume_token: "tok".to_string(),
            sequence: 0,
            operation: Operation::Update,
            database: "support".to_string(),
            collection: "tickets".to_string(),
            document_id: "t1".to_string(),
            full_document,
            cluster_time: chrono::Utc::now(),
        }
    }

    #[test]
    fn detects_own_echo() {
        let doc = serde_json::json!({"classification": {"agentRevision": 4, "idempotencyKey": "t1:classify:4"}});
        let e = event(Some(doc));
        assert!(is_self_triggered(&e, &agent(), "t1:classify:4"));
    }

    #[test]
    fn ignores_other_agents_writes() {
        let doc = serde_json::json!({"classification": {"agentRevision": 4, "idempotencyKey": "different-key"}});
        let e = event(Some(doc));
        assert!(!is_self_triggered(&e, &agent(), "t1:classify:4"));
    }

    #[test]
    fn ignores_stale_revision() {
        let doc = serde_json::json!({"classification": {"agentRevision": 3, "idempotencyKey": "t1:classify:4"}});
        let e = event(Some(doc));
        assert!(!is_self_triggered(&e, &agent(), "t1:classify:4"));
    }

    #[test]
    fn no_post_image_never_triggers() {
        assert!(!is_self_triggered(&event(None), &agent(), "t1:classify:4"));
    }
}
