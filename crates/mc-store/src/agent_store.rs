use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use mc_model::Agent;
use mongodb::bson::doc;
use mongodb::options::ChangeStreamOptions;
use mongodb::{Client, Collection, Database};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

/// A change notification from the AgentStore (§6 "Consumed interfaces").
#[derive(Debug, Clone)]
pub enum AgentChange {
    Created(String),
    Updated(String),
    Deleted(String),
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<Agent>>;
    async fn get(&self, id: &str) -> Result<Option<Agent>>;
    /// Stream of `{created|updated|deleted, id}` notifications, used to
    /// invalidate the in-memory cache (§3 "Lifecycle").
    async fn subscribe_changes(&self) -> Result<BoxStream<'static, AgentChange>>;
}

/// Mongo-backed AgentStore: `agents` collection, unique `id`, indexed on
/// `watch.database+collection` (§6 "Persisted layout"). Grounded on
/// `fc-platform::repository::subscription::SubscriptionRepository`.
pub struct MongoAgentStore {
    collection: Collection<Agent>,
    db: Database,
}

impl MongoAgentStore {
    pub fn new(client: &Client, database: &str) -> Self {
        let db = client.database(database);
        Self {
            collection: db.collection("agents"),
            db,
        }
    }
}

#[async_trait]
impl AgentStore for MongoAgentStore {
    async fn list_enabled(&self) -> Result<Vec<Agent>> {
        use futures::TryStreamExt;
        let cursor = self
            .collection
            .find(doc! { "enabled": true }, None)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        self.collection
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))
    }

    async fn subscribe_changes(&self) -> Result<BoxStream<'static, AgentChange>> {
        use futures::StreamExt;
        let raw: Collection<mongodb::bson::Document> = self.db.collection("agents");
        let options = ChangeStreamOptions::builder().build();
        let stream = raw
            .watch(None, options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;
        let mapped = stream.filter_map(|event| async move {
            let event = event.ok()?;
            let id = event
                .document_key
                .as_ref()
                .and_then(|k| k.get_str("_id").ok())
                .map(|s| s.to_string())?;
            use mongodb::change_stream::event::OperationType;
            match event.operation_type {
                OperationType::Insert => Some(AgentChange::Created(id)),
                OperationType::Update | OperationType::Replace => Some(AgentChange::Updated(id)),
                OperationType::Delete => Some(AgentChange::Deleted(id)),
                _ => None,
            }
        });
        Ok(Box::pin(mapped))
    }
}

/// In-memory AgentStore for tests and for the worker-pool/dispatcher unit
/// tests that don't want a live Mongo instance.
#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: DashMap<String, Agent>,
    subscribers: RwLock<Vec<tokio::sync::mpsc::UnboundedSender<AgentChange>>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, agent: Agent) {
        let change = if self.agents.contains_key(&agent.id) {
            AgentChange::Updated(agent.id.clone())
        } else {
            AgentChange::Created(agent.id.clone())
        };
        self.agents.insert(agent.id.clone(), agent);
        self.notify(change);
    }

    pub fn remove(&self, id: &str) {
        if self.agents.remove(id).is_some() {
            self.notify(AgentChange::Deleted(id.to_string()));
        }
    }

    fn notify(&self, change: AgentChange) {
        let subs = self.subscribers.read();
        for tx in subs.iter() {
            if tx.send(change.clone()).is_err() {
                warn!("agent change subscriber dropped");
            }
        }
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn list_enabled(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.iter().filter(|e| e.value().enabled).map(|e| e.value().clone()).collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.agents.get(id).map(|e| e.value().clone()))
    }

    async fn subscribe_changes(&self) -> Result<BoxStream<'static, AgentChange>> {
        use futures::StreamExt;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        info!("registered in-memory agent-change subscriber");
        Ok(tokio_stream::wrappers::UnboundedReceiverStream::new(rx).boxed())
    }
}

// Re-exported so `mc-store` doesn't force every caller to depend on
// `tokio-stream` directly just for the in-memory test double.
mod tokio_stream {
    pub mod wrappers {
        use futures::Stream;
        use std::pin::Pin;
        use std::task::{Context, Poll};

        pub struct UnboundedReceiverStream<T>(tokio::sync::mpsc::UnboundedReceiver<T>);

        impl<T> UnboundedReceiverStream<T> {
            pub fn new(rx: tokio::sync::mpsc::UnboundedReceiver<T>) -> Self {
                Self(rx)
            }
        }

        impl<T> Stream for UnboundedReceiverStream<T> {
            type Item = T;
            fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
                self.0.poll_recv(cx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mc_expr::Template;
    use mc_model::{AiSpec, ConsistencyMode, ExecutionSpec, Operation, WatchSpec, WriteSpec, WriteStrategy};

    fn sample_agent(id: &str, enabled: bool) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_string(),
            enabled,
            tags: vec![],
            watch: WatchSpec {
                database: "db".to_string(),
                collection: "coll".to_string(),
                operations: vec![Operation::Insert],
                filter: serde_json::Value::Null,
            },
            ai: AiSpec {
                provider: "anthropic".to_string(),
                model: "claude".to_string(),
                prompt: Template::parse("hi").unwrap(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 100,
                response_schema: None,
            },
            write: WriteSpec {
                strategy: WriteStrategy::Merge,
                target_field: "out".to_string(),
                idempotency_key: Template::parse("k").unwrap(),
                include_metadata: true,
            },
            execution: ExecutionSpec {
                max_retries: 1,
                retry_delay_ms: 100,
                timeout_ms: 1000,
                rate_limit_per_minute: 60,
                cost_limit_usd_per_hour: 1.0,
                consistency_mode: ConsistencyMode::Eventual,
            },
            revision: 1,
        }
    }

    #[tokio::test]
    async fn lists_only_enabled_agents() {
        let store = InMemoryAgentStore::new();
        store.upsert(sample_agent("a", true));
        store.upsert(sample_agent("b", false));
        let enabled = store.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");
    }

    #[tokio::test]
    async fn subscribers_observe_upserts_and_deletes() {
        let store = Arc::new(InMemoryAgentStore::new());
        let mut stream = store.subscribe_changes().await.unwrap();
        store.upsert(sample_agent("a", true));
        store.remove("a");
        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentChange::Created(id) if id == "a"));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, AgentChange::Deleted(id) if id == "a"));
    }
}
