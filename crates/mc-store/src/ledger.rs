use async_trait::async_trait;
use mc_model::{Execution, IdempotencyRecord, ResumeToken};
use mongodb::bson::doc;
use mongodb::options::UpdateOptions;
use mongodb::{Client, Collection};

use crate::error::{Result, StoreError};

/// Write-once execution ledger (`executions` collection, index
/// `agent_id+created_at desc`, TTL 7 days — §6 "Persisted layout").
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    async fn record(&self, execution: &Execution) -> Result<()>;
    async fn recent_for_agent(&self, agent_id: &str, limit: i64) -> Result<Vec<Execution>>;
}

pub struct MongoExecutionLedger {
    collection: Collection<Execution>,
}

impl MongoExecutionLedger {
    pub fn new(client: &Client, database: &str) -> Self {
        Self {
            collection: client.database(database).collection("executions"),
        }
    }
}

#[async_trait]
impl ExecutionLedger for MongoExecutionLedger {
    async fn record(&self, execution: &Execution) -> Result<()> {
        self.collection
            .insert_one(execution, None)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;
        Ok(())
    }

    async fn recent_for_agent(&self, agent_id: &str, limit: i64) -> Result<Vec<Execution>> {
        use futures::TryStreamExt;
        let find_options = mongodb::options::FindOptions::builder()
            .sort(doc! { "startedAt": -1 })
            .limit(limit)
            .build();
        let cursor = self
            .collection
            .find(doc! { "agentId": agent_id }, find_options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;
        cursor.try_collect().await.map_err(|e| StoreError::Mongo(e.to_string()))
    }
}

/// `resume_tokens` collection, unique `watcher_id` (§3, §6). Written by the
/// dispatcher after an event's whole fan-out is acked, not by the watcher.
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    async fn load(&self, watcher_id: &str) -> Result<Option<ResumeToken>>;
    async fn save(&self, token: &ResumeToken) -> Result<()>;
}

pub struct MongoResumeTokenStore {
    collection: Collection<ResumeToken>,
}

impl MongoResumeTokenStore {
    pub fn new(client: &Client, database: &str) -> Self {
        Self {
            collection: client.database(database).collection("resume_tokens"),
        }
    }
}

#[async_trait]
impl ResumeTokenStore for MongoResumeTokenStore {
    async fn load(&self, watcher_id: &str) -> Result<Option<ResumeToken>> {
        self.collection
            .find_one(doc! { "_id": watcher_id }, None)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))
    }

    async fn save(&self, token: &ResumeToken) -> Result<()> {
        let filter = doc! { "_id": &token.watcher_id };
        let update = doc! {
            "$set": {
                "token": &token.token,
                "updatedAt": mongodb::bson::DateTime::from_chrono(token.updated_at),
            }
        };
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(filter, update, options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;
        Ok(())
    }
}

/// `idempotency_keys` collection, unique `key`, TTL 24h (§3, §6). `setnx`
/// semantics (insert-if-absent) back the Write Engine's conditional write and
/// the worker's idempotency-check step (§4.4 step 2).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    /// Insert iff absent; returns `true` if this call won the insert.
    async fn set_if_absent(&self, record: &IdempotencyRecord) -> Result<bool>;
}

pub struct MongoIdempotencyStore {
    collection: Collection<IdempotencyRecord>,
}

impl MongoIdempotencyStore {
    pub fn new(client: &Client, database: &str) -> Self {
        Self {
            collection: client.database(database).collection("idempotency_keys"),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MongoIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.collection
            .find_one(doc! { "_id": key }, None)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))
    }

    async fn set_if_absent(&self, record: &IdempotencyRecord) -> Result<bool> {
        match self.collection.insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) => {
                if is_duplicate_key_error(&e) {
                    Ok(false)
                } else {
                    Err(StoreError::Mongo(e.to_string()))
                }
            }
        }
    }
}

fn is_duplicate_key_error(e: &mongodb::error::Error) -> bool {
    matches!(*e.kind, mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) if we.code == 11000)
}
