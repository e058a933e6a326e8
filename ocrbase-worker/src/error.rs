use ocrbase_common::error::{BlobError, BusError, CollaboratorError, QueueError, StoreError};
use thiserror::Error;

/// Enumeration of errors related to initialization and the outer poll loop,
/// as distinct from the per-job execution errors classified in
/// `ocrbase_common::error::CollaboratorError`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred: {0}")]
    Database(#[from] QueueError),
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("timed out while waiting for jobs to be available")]
    Timeout,
}
