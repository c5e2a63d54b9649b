//! Consumed-interface traits named in §6 — `AgentStore`, `DocumentStore`,
//! `ModelClient`, `MetricsSink` — plus Mongo-backed and in-memory
//! implementations, and the persisted-layout collections (executions,
//! resume tokens, idempotency keys).

pub mod agent_store;
pub mod document_store;
pub mod error;
pub mod ledger;
pub mod metrics_sink;
pub mod model_client;

pub use agent_store::{AgentChange, AgentStore, InMemoryAgentStore, MongoAgentStore};
pub use document_store::{DocumentPatch, DocumentStore, FeedEvent, MongoDocumentStore, UpdateOutcome, UpdatePrecondition};
pub use error::{ModelError, ModelErrorKind, Result, StoreError};
pub use ledger::{ExecutionLedger, IdempotencyStore, MongoExecutionLedger, MongoIdempotencyStore, MongoResumeTokenStore, ResumeTokenStore};
pub use metrics_sink::{Labels, MetricsSink, NullMetricsSink};
pub use model_client::{HttpModelClient, ModelClient, ModelMessage, ModelRequest, ModelResponse};
