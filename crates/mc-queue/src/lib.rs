//! `KeyValueStream` (§4.3, §6): a durable stream with consumer-group
//! semantics, backed by Redis in production and an in-process fake for tests.

pub mod error;
pub mod kv_stream;
pub mod memory_stream;
pub mod redis_stream;

pub use error::{QueueError, Result};
pub use kv_stream::{Delivery, KeyValueStream};
pub use memory_stream::InMemoryKeyValueStream;
pub use redis_stream::RedisKeyValueStream;
