//! Wire-facing error type for SDK consumers of the Client Waiter.
//! Mirrors `ocrbase_api::error::ApiError` in shape —
//! one typed enum per component boundary — but carries the subset of codes
//! a realtime subscriber can actually observe.

use thiserror::Error;

use ocrbase_common::error::ErrorCode;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The job reached `status = failed`; `error_code`/`message` are the Job
    /// Store's own `errorCode`/`errorMessage` at the time of the terminal
    /// read, not a transport-layer classification.
    #[error("job {job_id} failed: {message}")]
    JobFailed {
        job_id: String,
        error_code: Option<ErrorCode>,
        message: String,
    },

    /// Every reconnect attempt was exhausted without observing a terminal
    /// event. A `REALTIME_UNAVAILABLE`-shaped failure that is client-side
    /// only — never written to a Job row.
    #[error("realtime stream unavailable after {attempts} attempt(s)")]
    RealtimeUnavailable { attempts: u32 },

    /// The caller's own timeout elapsed before a terminal event arrived.
    #[error("timed out waiting for job {0} to complete")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed event payload: {0}")]
    MalformedEvent(String),

    #[error("server rejected the request: {status} {body}")]
    Server { status: u16, body: String },
}
