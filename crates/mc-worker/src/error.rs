use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] mc_queue::QueueError),
    #[error("store error: {0}")]
    Store(#[from] mc_store::StoreError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
