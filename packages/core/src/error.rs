use thiserror::Error;

use crate::consumer::ConsumerError;
use crate::queue::QueueError;
use crate::scheduler::DispatchError;
use crate::storage::StorageError;

/// Unified application error.
///
/// Every process role reports failure through this type; `main` logs it
/// and exits with status 1.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),
}
