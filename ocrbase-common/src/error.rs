//! Typed error taxonomy shared by every collaborator adapter.
//!
//! The worker only ever branches on these variants, never on a provider's
//! error message text: see `is_retryable` below and the discussion of
//! "retry classification by regex" in the design notes this crate follows.

use thiserror::Error;

/// Stable error codes written to `Job::error_code`. Matches the taxonomy table
/// verbatim; `Display` renders the exact wire string clients key off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UploadFailed,
    EnqueueFailed,
    JobNotFound,
    NoSource,
    FetchFailed,
    OcrFailed,
    SchemaNotFound,
    LlmParseFailed,
    /// Retryable network failure talking to the LLM collaborator. Not named in
    /// the base taxonomy table, added alongside it: see DESIGN.md.
    LlmFailed,
    Timeout,
    RealtimeUnavailable,
    AlreadyConfirmed,
    Validation,
    Unauthorized,
    Unknown,
}

impl ErrorCode {
    /// Whether the queue should redeliver a job that failed with this code,
    /// independent of the specific collaborator error that produced it.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::FetchFailed | ErrorCode::OcrFailed | ErrorCode::LlmFailed | ErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "UNKNOWN".to_owned());
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    /// Parses the SCREAMING_SNAKE_CASE wire form written to `Job::error_code`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unrecognized error code {s}"))
    }
}

/// A classified failure produced by a collaborator adapter (Blob Store, OCR,
/// LLM, URL fetch, Queue). The worker's execution sequence only inspects
/// `.code()`/`.is_retryable()`; it never parses `.to_string()`.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("blob store put failed: {0}")]
    BlobPutFailed(String),
    #[error("blob store transient error: {0}")]
    BlobTransient(String),
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("url fetch returned non-2xx status {status}")]
    FetchNonSuccess { status: u16 },
    #[error("url fetch transport error: {0}")]
    FetchTransient(String),
    #[error("OCR collaborator error: {0}")]
    OcrTransient(String),
    #[error("OCR collaborator unrecoverable error: {0}")]
    OcrUnrecoverable(String),
    #[error("LLM collaborator transport error: {0}")]
    LlmTransient(String),
    #[error("LLM response could not be reconciled to the schema")]
    LlmParseFailed,
    #[error("schema {0} not found")]
    SchemaNotFound(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CollaboratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollaboratorError::BlobPutFailed(_) => ErrorCode::UploadFailed,
            // §4.2 step 3 treats "obtain input bytes" as one operation whether the
            // source is a blobKey or a sourceUrl; the taxonomy only names
            // FETCH_FAILED for it, so blob read failures share that code too
            // (see DESIGN.md Open Question: blob-read failure code).
            CollaboratorError::BlobTransient(_) | CollaboratorError::BlobNotFound(_) => {
                ErrorCode::FetchFailed
            }
            CollaboratorError::FetchNonSuccess { .. } | CollaboratorError::FetchTransient(_) => {
                ErrorCode::FetchFailed
            }
            CollaboratorError::OcrTransient(_) | CollaboratorError::OcrUnrecoverable(_) => {
                ErrorCode::OcrFailed
            }
            CollaboratorError::LlmTransient(_) => ErrorCode::LlmFailed,
            CollaboratorError::LlmParseFailed => ErrorCode::LlmParseFailed,
            CollaboratorError::SchemaNotFound(_) => ErrorCode::SchemaNotFound,
            CollaboratorError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Unrecoverable errors flip the job to `failed` on first occurrence;
    /// everything else (including unknown errors) is retried up to
    /// `max_attempts` by default.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollaboratorError::BlobPutFailed(_)
            | CollaboratorError::OcrUnrecoverable(_)
            | CollaboratorError::LlmParseFailed
            | CollaboratorError::SchemaNotFound(_) => false,
            CollaboratorError::FetchNonSuccess { status } => {
                matches!(*status, 429 | 502 | 503 | 504)
            }
            CollaboratorError::BlobTransient(_)
            | CollaboratorError::FetchTransient(_)
            | CollaboratorError::OcrTransient(_)
            | CollaboratorError::LlmTransient(_)
            | CollaboratorError::Unknown(_) => true,
        }
    }
}

/// Errors from the durable Job Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} has already been confirmed")]
    AlreadyConfirmed(String),
}

impl StoreError {
    /// SQLSTATE-based classifier: prefer the typed error code over any
    /// message heuristic.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connection(sqlx::Error::Io(_))
            | StoreError::Connection(sqlx::Error::PoolTimedOut)
            | StoreError::Connection(sqlx::Error::PoolClosed) => true,
            StoreError::Connection(sqlx::Error::Database(db_error)) => db_error
                .code()
                .map(|code| {
                    let code = code.as_ref();
                    code.starts_with("08")
                        || code.starts_with("53")
                        || code.starts_with("57")
                        || code.starts_with("58")
                        || code == "40001"
                        || code == "40P01"
                })
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Errors from the Blob Store collaborator.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
    #[error("object not found: {0}")]
    NotFound(String),
}

/// Errors raised by the Queue (Work Item dequeue/enqueue/ack).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job {0} has reached max attempts and cannot be retried further")]
    MaxAttemptsReached(String),
}

/// Errors surfaced by the Event Bus.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("subscribe timed out waiting for readiness")]
    SubscribeTimeout,
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),
}
