//! The `Job` entity and its satellite types: status, source, work item, and
//! the tagged realtime `Event` variants published to the Event Bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

/// Opaque, prefixed identifier. `job_<uuid v7>`, monotonic and sortable the
/// way the rest of this codebase generates ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        JobId(format!("job_{}", Uuid::now_v7()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Parse,
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Extracting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Validates a transition against the state machine DAG in the
    /// worker's execution sequence. A terminal status never transitions out.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) => true,
            (Processing, Extracting) => true,
            (Processing, Failed) => true,
            (Extracting, Completed) => true,
            (Extracting, Failed) => true,
            (same, other) if same == other => true,
            _ => false,
        }
    }
}

/// Exactly one of these is ever set on a `Job`. Wire shape per §3 is
/// `{blobKey}`, `{sourceUrl}`, or `{pendingUpload: blobKey}` — note the third
/// variant's wire key is `pendingUpload`, not `blobKey`, so the rename is
/// per-field rather than a blanket `rename_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobSource {
    Blob {
        #[serde(rename = "blobKey")]
        blob_key: String,
    },
    Url {
        #[serde(rename = "sourceUrl")]
        source_url: String,
    },
    PendingUpload {
        #[serde(rename = "pendingUpload")]
        blob_key: String,
    },
}

impl JobSource {
    pub fn blob_key(&self) -> Option<&str> {
        match self {
            JobSource::Blob { blob_key } | JobSource::PendingUpload { blob_key } => {
                Some(blob_key)
            }
            JobSource::Url { .. } => None,
        }
    }

    pub fn source_url(&self) -> Option<&str> {
        match self {
            JobSource::Url { source_url } => Some(source_url),
            _ => None,
        }
    }

    pub fn is_pending_upload(&self) -> bool {
        matches!(self, JobSource::PendingUpload { .. })
    }
}

/// The single entity at the core of the pipeline.
/// Wire-cased `camelCase` to match the realtime event payload shapes — this
/// is the same `Job` the Submission API returns as a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub source: JobSource,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub schema_ref: Option<String>,
    pub hints: Option<String>,
    pub markdown_result: Option<String>,
    pub json_result: Option<serde_json::Value>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub processing_time_ms: Option<i64>,
    pub page_count: Option<i32>,
    pub llm_model: Option<String>,
    pub token_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Invariant (2): `markdownResult` is present for any completed job.
    /// Invariant (3): `jsonResult` present iff `type = extract ∧ completed`.
    /// Invariant (4) as enforced here is one-directional: a `failed` job must
    /// carry an `errorCode`, but a non-terminal job may carry one too — §4.2
    /// has the Worker write the most recent `errorCode`/`errorMessage` on
    /// every attempt while `status` stays `processing`/`extracting`, and only
    /// the Queue's terminal-failure callback flips `status` to `failed`.
    /// Enforcing the `iff` in both directions would reject that write.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if self.status == JobStatus::Completed && self.markdown_result.is_none() {
            return Err("completed job missing markdownResult");
        }
        let json_should_be_present =
            self.job_type == JobType::Extract && self.status == JobStatus::Completed;
        if self.json_result.is_some() != json_should_be_present {
            return Err("jsonResult presence does not match type/status invariant");
        }
        if self.status == JobStatus::Failed && self.error_code.is_none() {
            return Err("failed job missing errorCode");
        }
        Ok(())
    }
}

/// A field-scoped patch applied by `JobStore::update`. Every field is
/// optional so concurrent writers touching disjoint fields never clobber
/// each other.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub source: Option<JobSource>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub markdown_result: Option<String>,
    pub json_result: Option<serde_json::Value>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub attempts_made: Option<i32>,
    pub processing_time_ms: Option<i64>,
    pub page_count: Option<i32>,
    pub llm_model: Option<String>,
    pub token_count: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A filter accepted by `JobStore::list`, used by the out-of-scope UI.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub tenant_id: Option<String>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

/// Descriptor enqueued onto the Queue exactly when the Job row is durable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,
    pub tenant_id: String,
    pub submitter_id: String,
    pub request_id: Option<String>,
}

/// Tagged realtime event variants. Discriminator is `type`; every parser
/// validates it before touching the payload (see DESIGN.md: tagged event
/// variants replace dynamically typed payloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status {
        #[serde(rename = "jobId")]
        job_id: JobId,
        data: StatusData,
    },
    Completed {
        #[serde(rename = "jobId")]
        job_id: JobId,
        data: CompletedData,
    },
    Error {
        #[serde(rename = "jobId")]
        job_id: JobId,
        data: ErrorData,
    },
    Pong {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

impl Event {
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::Status { job_id, .. }
            | Event::Completed { job_id, .. }
            | Event::Error { job_id, .. }
            | Event::Pong { job_id } => job_id,
        }
    }

    /// True for the two events the Gateway treats as terminal: it stops
    /// forwarding and closes the stream after either of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed { .. } | Event::Error { .. })
    }

    /// The `type` discriminator, matching both the serialized tag and the
    /// SSE `event:` field name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::Completed { .. } => "completed",
            Event::Error { .. } => "error",
            Event::Pong { .. } => "pong",
        }
    }

    /// Synthesize the appropriate terminal event from a Job Store snapshot,
    /// used by the subscribe-then-snapshot race protocol in §4.3.
    pub fn from_terminal_snapshot(job: &Job) -> Option<Event> {
        match job.status {
            JobStatus::Completed => Some(Event::Completed {
                job_id: job.id.clone(),
                data: CompletedData {
                    status: JobStatus::Completed,
                    markdown_result: job.markdown_result.clone(),
                    json_result: job.json_result.clone(),
                    processing_time_ms: job.processing_time_ms,
                },
            }),
            JobStatus::Failed => Some(Event::Error {
                job_id: job.id.clone(),
                data: ErrorData {
                    status: Some(JobStatus::Failed),
                    error: job
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "job failed".to_owned()),
                },
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedData {
    pub status: JobStatus,
    #[serde(rename = "markdownResult", skip_serializing_if = "Option::is_none")]
    pub markdown_result: Option<String>,
    #[serde(rename = "jsonResult", skip_serializing_if = "Option::is_none")]
    pub json_result: Option<serde_json::Value>,
    #[serde(
        rename = "processingTimeMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub processing_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub error: String,
}
