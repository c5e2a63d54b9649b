use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed stream entry: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
