//! The three admission paths: direct upload, URL
//! ingest, and the presigned two-phase upload.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ocrbase_common::blob::{self, BlobStore as _};
use ocrbase_common::job::{Job, JobId, JobPatch, JobSource, JobStatus, JobType, WorkItem};
use ocrbase_common::queue::{EnqueueOpts, Queue as _};
use ocrbase_common::schema::{self, SchemaRegistry as _, SimpleObjectSpec};
use ocrbase_common::store::JobStore as _;

use crate::auth::AuthContext;
use crate::error::{ApiError, Result};
use crate::state::AppState;
use crate::validation;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Base64-encoded bytes for a direct upload. Exactly one of `file`/`url`
    /// must be set.
    pub file: Option<String>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    #[serde(flatten)]
    pub submit: SubmitRequest,
    /// A previously registered schema reference. Exactly one of `schema_id`,
    /// `schema`, or `simple_schema` resolves the job's `schemaRef`; the
    /// latter two are normalized to canonical JSON Schema and registered on
    /// the fly by the Schema Adapter.
    pub schema_id: Option<String>,
    pub schema: Option<serde_json::Value>,
    pub simple_schema: Option<BTreeMap<String, String>>,
    pub hints: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub file_name: String,
    pub mime_type: String,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    pub schema_id: Option<String>,
    pub schema: Option<serde_json::Value>,
    pub simple_schema: Option<BTreeMap<String, String>>,
    pub hints: Option<String>,
}

fn default_job_type() -> JobType {
    JobType::Parse
}

#[derive(Debug, Serialize)]
pub struct PresignResponse {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    #[serde(rename = "uploadUrl")]
    pub upload_url: String,
}

/// `POST /v1/parse`.
pub async fn parse(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<Job>> {
    let job = admit(&state, &auth, JobType::Parse, body, None).await?;
    Ok(Json(job))
}

/// `POST /v1/extract`.
pub async fn extract(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ExtractRequest>,
) -> Result<Json<Job>> {
    let schema_ref = resolve_schema_ref(
        &state,
        body.schema_id,
        body.schema,
        body.simple_schema,
    )
    .await?;
    let job = admit(
        &state,
        &auth,
        JobType::Extract,
        body.submit,
        Some((schema_ref, body.hints)),
    )
    .await?;
    Ok(Json(job))
}

async fn resolve_schema_ref(
    state: &AppState,
    schema_id: Option<String>,
    schema: Option<serde_json::Value>,
    simple_schema: Option<BTreeMap<String, String>>,
) -> Result<String> {
    if let Some(reference) = schema_id {
        return Ok(reference);
    }

    let resolved = if let Some(document) = schema {
        schema::from_json_schema(document)
            .map_err(|e| ApiError::Validation(e.to_string()))?
    } else if let Some(fields) = simple_schema {
        schema::from_simple_object(&SimpleObjectSpec(fields))
            .map_err(|e| ApiError::Validation(e.to_string()))?
    } else {
        return Err(ApiError::Validation(
            "extract requires one of schemaId, schema, or simpleSchema".to_owned(),
        ));
    };

    let reference = format!("schema_{}", uuid::Uuid::now_v7());
    state
        .schemas
        .register(&reference, resolved.document)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(reference)
}

async fn admit(
    state: &AppState,
    auth: &AuthContext,
    job_type: JobType,
    body: SubmitRequest,
    extract: Option<(String, Option<String>)>,
) -> Result<Job> {
    match (&body.file, &body.url) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(ApiError::Validation(
                "exactly one of file or url is required".to_owned(),
            ));
        }
        _ => {}
    }

    let job_id = JobId::new();
    let (schema_ref, hints) = match extract {
        Some((schema_ref, hints)) => (Some(schema_ref), hints),
        None => (None, None),
    };

    if let Some(encoded) = body.file {
        let mime_type = body
            .mime_type
            .ok_or_else(|| ApiError::Validation("mimeType is required for file uploads".into()))?;
        validation::validate_mime_type(&mime_type)?;
        let file_name = body
            .file_name
            .ok_or_else(|| ApiError::Validation("fileName is required for file uploads".into()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ApiError::Validation(format!("file is not valid base64: {e}")))?;
        validation::validate_file_size(bytes.len())?;

        let blob_key = blob::blob_key(&auth.tenant_id, &job_id.0, &file_name);
        let now = Utc::now();
        let job = Job {
            id: job_id.clone(),
            tenant_id: auth.tenant_id.clone(),
            job_type,
            status: JobStatus::Pending,
            source: JobSource::Blob {
                blob_key: blob_key.clone(),
            },
            file_name: Some(file_name),
            mime_type: Some(mime_type),
            file_size: Some(bytes.len() as i64),
            schema_ref,
            hints,
            markdown_result: None,
            json_result: None,
            error_code: None,
            error_message: None,
            attempts_made: 0,
            max_attempts: state.default_max_attempts,
            processing_time_ms: None,
            page_count: None,
            llm_model: None,
            token_count: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            deleted_at: None,
        };
        let created = state.store.create(job).await?;

        // Upload bytes, then enqueue. Either failure flips the job to
        // `failed` synchronously rather than leaving it stuck `pending`.
        if let Err(error) = state.blob.put(&blob_key, bytes.into()).await {
            return Ok(fail_admission(state, &created.id, "UPLOAD_FAILED", &error.to_string()).await);
        }

        if let Err(error) = enqueue_work_item(state, &created, auth).await {
            return Ok(fail_admission(state, &created.id, "ENQUEUE_FAILED", &error.to_string()).await);
        }

        return Ok(state.store.get(&created.id).await?);
    }

    let url = body.url.expect("checked above: exactly one of file/url is set");
    validation::validate_url_scheme(&url)?;

    let now = Utc::now();
    let job = Job {
        id: job_id.clone(),
        tenant_id: auth.tenant_id.clone(),
        job_type,
        status: JobStatus::Pending,
        source: JobSource::Url { source_url: url },
        file_name: body.file_name,
        mime_type: body.mime_type,
        file_size: None,
        schema_ref,
        hints,
        markdown_result: None,
        json_result: None,
        error_code: None,
        error_message: None,
        attempts_made: 0,
        max_attempts: state.default_max_attempts,
        processing_time_ms: None,
        page_count: None,
        llm_model: None,
        token_count: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
        deleted_at: None,
    };
    let created = state.store.create(job).await?;

    if let Err(error) = enqueue_work_item(state, &created, auth).await {
        return Ok(fail_admission(state, &created.id, "ENQUEUE_FAILED", &error.to_string()).await);
    }

    Ok(state.store.get(&created.id).await?)
}

async fn enqueue_work_item(
    state: &AppState,
    job: &Job,
    auth: &AuthContext,
) -> std::result::Result<(), ocrbase_common::error::QueueError> {
    let item = WorkItem {
        job_id: job.id.clone(),
        tenant_id: auth.tenant_id.clone(),
        submitter_id: auth.submitter_id.clone(),
        request_id: None,
    };
    state
        .queue
        .enqueue(
            item,
            EnqueueOpts {
                max_attempts: job.max_attempts,
                ..EnqueueOpts::default()
            },
        )
        .await
}

/// Marks admission-time failures: these never reach
/// the Worker, so there's no retry classification to apply, only a direct
/// terminal write.
async fn fail_admission(state: &AppState, job_id: &JobId, code: &str, message: &str) -> Job {
    use std::str::FromStr;
    let error_code = ocrbase_common::error::ErrorCode::from_str(code).ok();
    let patch = JobPatch {
        status: Some(JobStatus::Failed),
        error_code,
        error_message: Some(message.to_owned()),
        completed_at: Some(Utc::now()),
        ..Default::default()
    };
    match state.store.update(job_id, patch).await {
        Ok(job) => job,
        Err(_) => state
            .store
            .get(job_id)
            .await
            .expect("job was just created, must still exist"),
    }
}

/// `POST /v1/uploads/presign`.
pub async fn presign(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<PresignRequest>,
) -> Result<Json<PresignResponse>> {
    validation::validate_mime_type(&body.mime_type)?;

    let schema_ref = if body.job_type == JobType::Extract {
        Some(
            resolve_schema_ref(&state, body.schema_id, body.schema, body.simple_schema).await?,
        )
    } else {
        None
    };

    let job_id = JobId::new();
    let blob_key = blob::blob_key(&auth.tenant_id, &job_id.0, &body.file_name);
    let presigned = state
        .blob
        .presign_put(&blob_key, ChronoDuration::seconds(state.presign_ttl_secs))
        .await?;

    let now = Utc::now();
    let job = Job {
        id: job_id.clone(),
        tenant_id: auth.tenant_id.clone(),
        job_type: body.job_type,
        status: JobStatus::Pending,
        source: JobSource::PendingUpload {
            blob_key: blob_key.clone(),
        },
        file_name: Some(body.file_name),
        mime_type: Some(body.mime_type),
        file_size: None,
        schema_ref,
        hints: body.hints,
        markdown_result: None,
        json_result: None,
        error_code: None,
        error_message: None,
        attempts_made: 0,
        max_attempts: state.default_max_attempts,
        processing_time_ms: None,
        page_count: None,
        llm_model: None,
        token_count: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
        deleted_at: None,
    };
    state.store.create(job).await?;

    Ok(Json(PresignResponse {
        job_id,
        upload_url: presigned.upload_url,
    }))
}

/// `POST /v1/uploads/{jobId}/complete`.
pub async fn complete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Job>> {
    let job = state.store.get(&job_id).await?;
    if job.tenant_id != auth.tenant_id {
        return Err(ApiError::NotFound(job_id.0));
    }
    if !job.source.is_pending_upload() || job.status != JobStatus::Pending {
        return Err(ApiError::AlreadyConfirmed(job_id.0));
    }

    let blob_key = job
        .source
        .blob_key()
        .expect("pending_upload sources always carry a blobKey")
        .to_owned();
    if !state.blob.exists(&blob_key).await? {
        return Err(ApiError::Validation(format!(
            "no object has been uploaded to {blob_key} yet"
        )));
    }

    let confirmed = state
        .store
        .update(
            &job_id,
            JobPatch {
                source: Some(JobSource::Blob {
                    blob_key: blob_key.clone(),
                }),
                ..Default::default()
            },
        )
        .await?;

    if let Err(error) = enqueue_work_item(&state, &confirmed, &auth).await {
        return Ok(Json(
            fail_admission(&state, &job_id, "ENQUEUE_FAILED", &error.to_string()).await,
        ));
    }

    Ok(Json(state.store.get(&job_id).await?))
}
