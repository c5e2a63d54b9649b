use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use mc_model::Operation;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ChangeStreamOptions, FindOneOptions, FullDocumentType, UpdateOptions};
use mongodb::Client;
use serde_json::Value;

use crate::error::{Result, StoreError};

/// One normalized change-feed event as delivered by the store (§6).
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub operation: Operation,
    pub database: String,
    pub collection: String,
    pub document_id: String,
    pub full_document: Option<Value>,
    pub token: String,
    pub cluster_time: DateTime<Utc>,
}

/// How the Write Engine wants a document mutated (§4.5).
#[derive(Debug, Clone)]
pub enum DocumentPatch {
    /// Set `field` to `value` (`merge`/`replace` strategies).
    Set { field: String, value: Value },
    /// Push `value` onto the array at `field` (`append` strategy).
    Push { field: String, value: Value },
}

/// Conditional-write guard applied on top of the `_id` match (§4.5
/// "conditional update"). Keeps every write strategy a single `update_one`.
#[derive(Debug, Clone)]
pub enum UpdatePrecondition {
    /// The update only applies if `envelope_key_field` is absent or not equal
    /// to `expected_absent_key` (`merge`/`replace` strategies).
    FieldNotEqual { envelope_key_field: String, expected_absent_key: String },
    /// The update only applies if no element of `array_field` already has
    /// `key_field == key_value` (`append`'s in-array dedup).
    ArrayElementAbsent { array_field: String, key_field: String, key_value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn subscribe(
        &self,
        database: &str,
        collection: &str,
        resume_token: Option<String>,
    ) -> Result<BoxStream<'static, Result<FeedEvent>>>;

    async fn update(
        &self,
        database: &str,
        collection: &str,
        document_id: &str,
        patch: DocumentPatch,
        precondition: UpdatePrecondition,
    ) -> Result<UpdateOutcome>;
}

/// Mongo-backed DocumentStore: change streams for the feed, conditional
/// `update_one` for writes. Grounded on `fc-stream::watcher::MongoStreamWatcher`
/// (stream shape) and `fc-outbox::mongo::MongoOutboxRepository` (conditional
/// update idiom).
pub struct MongoDocumentStore {
    client: Client,
}

impl MongoDocumentStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn subscribe(
        &self,
        database: &str,
        collection: &str,
        resume_token: Option<String>,
    ) -> Result<BoxStream<'static, Result<FeedEvent>>> {
        use futures::StreamExt;

        let db = self.client.database(database);
        let coll: mongodb::Collection<Document> = db.collection(collection);

        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();
        if let Some(token) = resume_token {
            if let Ok(raw) = mongodb::bson::from_slice::<mongodb::change_stream::event::ResumeToken>(token.as_bytes()) {
                options.resume_after = Some(raw);
            }
        }

        let stream = coll
            .watch(None, options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;

        let database = database.to_string();
        let collection = collection.to_string();
        let mapped = stream.map(move |item| {
            let event = item.map_err(|e| StoreError::Mongo(e.to_string()))?;
            let document_id = event
                .document_key
                .as_ref()
                .and_then(|k| k.get("_id"))
                .map(bson_to_id_string)
                .unwrap_or_default();
            let operation = match event.operation_type {
                mongodb::change_stream::event::OperationType::Insert => Operation::Insert,
                mongodb::change_stream::event::OperationType::Update => Operation::Update,
                mongodb::change_stream::event::OperationType::Replace => Operation::Replace,
                mongodb::change_stream::event::OperationType::Delete => Operation::Delete,
                _ => Operation::Update,
            };
            let full_document = event
                .full_document
                .map(|d| serde_json::to_value(d).unwrap_or(Value::Null));
            let token = serde_json::to_string(&event.id).unwrap_or_default();
            let cluster_time = event
                .cluster_time
                .map(|t| DateTime::<Utc>::from_timestamp(t.time as i64, 0).unwrap_or_else(Utc::now))
                .unwrap_or_else(Utc::now);
            Ok(FeedEvent {
                operation,
                database: database.clone(),
                collection: collection.clone(),
                document_id,
                full_document,
                token,
                cluster_time,
            })
        });

        Ok(Box::pin(mapped))
    }

    async fn update(
        &self,
        database: &str,
        collection: &str,
        document_id: &str,
        patch: DocumentPatch,
        precondition: UpdatePrecondition,
    ) -> Result<UpdateOutcome> {
        let coll: mongodb::Collection<Document> = self.client.database(database).collection(collection);

        let guard = match &precondition {
            UpdatePrecondition::FieldNotEqual { envelope_key_field, expected_absent_key } => doc! {
                "$or": [
                    { envelope_key_field: { "$exists": false } },
                    { envelope_key_field: { "$ne": expected_absent_key } },
                ],
            },
            UpdatePrecondition::ArrayElementAbsent { array_field, key_field, key_value } => doc! {
                array_field: {
                    "$not": { "$elemMatch": { key_field: key_value } },
                },
            },
        };
        let filter = doc! {
            "_id": document_id,
            "$and": [guard],
        };

        let update = match patch {
            DocumentPatch::Set { field, value } => {
                let bson_value = mongodb::bson::to_bson(&value).map_err(|e| StoreError::Mongo(e.to_string()))?;
                doc! { "$set": { field: bson_value } }
            }
            DocumentPatch::Push { field, value } => {
                let bson_value = mongodb::bson::to_bson(&value).map_err(|e| StoreError::Mongo(e.to_string()))?;
                doc! { "$push": { field: bson_value } }
            }
        };

        let options = UpdateOptions::builder().upsert(false).build();
        let result = coll
            .update_one(filter, update, options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?;

        if result.matched_count > 0 {
            return Ok(UpdateOutcome {
                matched: result.matched_count,
                modified: result.modified_count,
            });
        }

        // The guarded filter matched nothing — either the document doesn't
        // exist, or it does but the precondition already blocked this write
        // (a duplicate idempotency key replaying). A bare `_id` lookup tells
        // those two apart so callers can treat the latter as a no-op instead
        // of a missing document.
        let exists_options = FindOneOptions::builder().projection(doc! { "_id": 1 }).build();
        let exists = coll
            .find_one(doc! { "_id": document_id }, exists_options)
            .await
            .map_err(|e| StoreError::Mongo(e.to_string()))?
            .is_some();

        Ok(UpdateOutcome { matched: if exists { 1 } else { 0 }, modified: 0 })
    }
}

fn bson_to_id_string(b: &Bson) -> String {
    match b {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}
