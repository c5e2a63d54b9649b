//! Write Engine (§4.5): commits a model's output back to the source document
//! under `merge`/`replace`/`append`, using a single conditional `update_one`
//! per write so duplicate replays are a no-op rather than a second mutation.

mod envelope;
mod error;

use chrono::{DateTime, Utc};
use mc_model::agent::WriteStrategy;
use mc_store::{DocumentPatch, DocumentStore, UpdateOutcome, UpdatePrecondition};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub use envelope::{MinimalAppendEntry, WriteEnvelope};
pub use error::{Result, WriteError};

/// Everything the Write Engine needs to commit one model result (§4.4 step 8
/// calls this after a successful model invocation).
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub database: String,
    pub collection: String,
    pub document_id: String,
    pub strategy: WriteStrategy,
    pub target_field: String,
    pub value: Value,
    pub idempotency_key: String,
    pub include_metadata: bool,
    pub agent_id: String,
    pub agent_revision: u64,
    pub executed_at: DateTime<Utc>,
    /// The agent's revision as currently known by the AgentStore, if it still
    /// exists — `None` if the agent has been deleted since the event fired.
    pub live_agent_revision: Option<u64>,
}

/// Outcome of a single write attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// `false` means the conditional update matched but did not modify the
    /// document — a replay of an already-applied idempotency key.
    pub written: bool,
    /// `true` if `live_agent_revision` no longer matches `agent_revision` —
    /// the write still proceeds (it represents prior work) but the caller
    /// should tag the Execution `stale_agent`.
    pub stale_agent: bool,
    /// Hex-encoded SHA-256 of the written value, recorded alongside the
    /// idempotency entry so a later audit can tell two executions apart.
    pub result_fingerprint: String,
}

/// Commits Write Engine results to documents via a `DocumentStore` (§4.5).
/// Grounded on `fc-outbox::mongo::MongoOutboxRepository`'s conditional-update
/// idiom, generalized across the three write strategies.
pub struct WriteEngine {
    store: Arc<dyn DocumentStore>,
}

impl WriteEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn write(&self, req: WriteRequest) -> Result<WriteOutcome> {
        let stale_agent = req.live_agent_revision != Some(req.agent_revision);
        let result_fingerprint = fingerprint(&req.value);

        let (patch, precondition) = match req.strategy {
            WriteStrategy::Merge | WriteStrategy::Replace => {
                let field_value = if req.include_metadata {
                    let envelope = WriteEnvelope::new(
                        req.value.clone(),
                        req.agent_id.clone(),
                        req.agent_revision,
                        req.executed_at,
                        req.idempotency_key.clone(),
                    );
                    serde_json::to_value(envelope)?
                } else {
                    req.value.clone()
                };
                let envelope_key_field = if req.include_metadata {
                    format!("{}.idempotencyKey", req.target_field)
                } else {
                    // Without metadata there is nowhere to stash the key on the
                    // document itself; fall back to a sentinel field that never
                    // collides with real content so the write still applies once.
                    format!("{}__mcIdempotencyKey", req.target_field)
                };
                let patch = DocumentPatch::Set { field: req.target_field.clone(), value: field_value };
                let precondition = UpdatePrecondition::FieldNotEqual {
                    envelope_key_field,
                    expected_absent_key: req.idempotency_key.clone(),
                };
                (patch, precondition)
            }
            WriteStrategy::Append => {
                let entry = if req.include_metadata {
                    serde_json::to_value(WriteEnvelope::new(
                        req.value.clone(),
                        req.agent_id.clone(),
                        req.agent_revision,
                        req.executed_at,
                        req.idempotency_key.clone(),
                    ))?
                } else {
                    serde_json::to_value(MinimalAppendEntry { value: req.value.clone(), idempotency_key: req.idempotency_key.clone() })?
                };
                let patch = DocumentPatch::Push { field: req.target_field.clone(), value: entry };
                let precondition = UpdatePrecondition::ArrayElementAbsent {
                    array_field: req.target_field.clone(),
                    key_field: "idempotencyKey".to_string(),
                    key_value: req.idempotency_key.clone(),
                };
                (patch, precondition)
            }
        };

        let outcome: UpdateOutcome = self
            .store
            .update(&req.database, &req.collection, &req.document_id, patch, precondition)
            .await?;

        if outcome.matched == 0 {
            return Err(WriteError::DocumentMissing(req.document_id));
        }

        Ok(WriteOutcome {
            written: outcome.modified > 0,
            stale_agent,
            result_fingerprint,
        })
    }
}

fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use mc_store::{DocumentPatch as Patch, FeedEvent};
    use parking_lot::Mutex;

    struct FakeStore {
        applied: Mutex<Vec<(String, UpdatePrecondition)>>,
        modify: bool,
        matched: bool,
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn subscribe(
            &self,
            _database: &str,
            _collection: &str,
            _resume_token: Option<String>,
        ) -> mc_store::Result<BoxStream<'static, mc_store::Result<FeedEvent>>> {
            unimplemented!("not exercised by write engine tests")
        }

        async fn update(
            &self,
            _database: &str,
            _collection: &str,
            document_id: &str,
            patch: Patch,
            precondition: UpdatePrecondition,
        ) -> mc_store::Result<UpdateOutcome> {
            self.applied.lock().push((document_id.to_string(), precondition));
            let _ = patch;
            Ok(UpdateOutcome {
                matched: if self.matched { 1 } else { 0 },
                modified: if self.modify { 1 } else { 0 },
            })
        }
    }

    fn base_request() -> WriteRequest {
        WriteRequest {
            database: "support".to_string(),
            collection: "tickets".to_string(),
            document_id: "t1".to_string(),
            strategy: WriteStrategy::Merge,
            target_field: "classification".to_string(),
            value: serde_json::json!({"label": "billing"}),
            idempotency_key: "t1:classify:7".to_string(),
            include_metadata: true,
            agent_id: "classify".to_string(),
            agent_revision: 7,
            executed_at: Utc::now(),
            live_agent_revision: Some(7),
        }
    }

    #[tokio::test]
    async fn merge_write_reports_written_true() {
        let store = Arc::new(FakeStore { applied: Mutex::new(vec![]), modify: true, matched: true });
        let engine = WriteEngine::new(store);
        let outcome = engine.write(base_request()).await.unwrap();
        assert!(outcome.written);
        assert!(!outcome.stale_agent);
        assert!(!outcome.result_fingerprint.is_empty());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_noop() {
        let store = Arc::new(FakeStore { applied: Mutex::new(vec![]), modify: false, matched: true });
        let engine = WriteEngine::new(store);
        let outcome = engine.write(base_request()).await.unwrap();
        assert!(!outcome.written);
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let store = Arc::new(FakeStore { applied: Mutex::new(vec![]), modify: false, matched: false });
        let engine = WriteEngine::new(store);
        let err = engine.write(base_request()).await.unwrap_err();
        assert!(matches!(err, WriteError::DocumentMissing(_)));
    }

    #[tokio::test]
    async fn stale_agent_is_flagged_but_still_writes() {
        let store = Arc::new(FakeStore { applied: Mutex::new(vec![]), modify: true, matched: true });
        let engine = WriteEngine::new(store);
        let mut req = base_request();
        req.live_agent_revision = None;
        let outcome = engine.write(req).await.unwrap();
        assert!(outcome.written);
        assert!(outcome.stale_agent);
    }

    #[tokio::test]
    async fn append_strategy_uses_array_precondition() {
        let store = Arc::new(FakeStore { applied: Mutex::new(vec![]), modify: true, matched: true });
        let engine = WriteEngine::new(store.clone());
        let mut req = base_request();
        req.strategy = WriteStrategy::Append;
        req.target_field = "history".to_string();
        engine.write(req).await.unwrap();
        let applied = store.applied.lock();
        assert!(matches!(applied[0].1, UpdatePrecondition::ArrayElementAbsent { .. }));
    }
}
