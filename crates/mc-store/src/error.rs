use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongo error: {0}")]
    Mongo(String),
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
}

/// Provider error classification (§6 "Consumed interfaces" / ModelClient).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    #[error("timeout")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("4xx")]
    ClientError,
    #[error("5xx")]
    ServerError,
    #[error("other")]
    Other,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
