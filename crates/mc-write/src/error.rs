/// Failures the Write Engine can surface. A duplicate write is not an error —
/// see `WriteOutcome::written = false` — only genuine infra/shape problems land here.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("store error: {0}")]
    Store(#[from] mc_store::StoreError),

    #[error("target document {0} no longer exists")]
    DocumentMissing(String),

    #[error("failed to encode write envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WriteError>;
