//! Drives the Job state machine: dequeue a
//! Work Item, load its Job, fetch bytes, OCR, optionally extract via the LLM
//! collaborator, and persist the terminal row. Failure classification
//! branches only on the typed `ErrorCode`/`is_retryable` pair a collaborator
//! adapter attaches to its error, never on message text.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use health::HealthHandle;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;

use ocrbase_common::blob::BlobStore;
use ocrbase_common::bus::EventBus;
use ocrbase_common::collaborators::{LlmCollaborator, OcrCollaborator};
use ocrbase_common::error::{CollaboratorError, ErrorCode, StoreError};
use ocrbase_common::job::{CompletedData, Event, Job, JobId, JobPatch, JobStatus, JobType, StatusData};
use ocrbase_common::queue::{Delivery, Queue};
use ocrbase_common::schema::{self, SchemaRegistry};
use ocrbase_common::store::JobStore;

/// A classified failure from one attempt: the stable `ErrorCode` written to
/// the job row, a human-readable message, and whether the Queue should
/// redeliver.
#[derive(Debug, Clone)]
struct JobFailure {
    code: ErrorCode,
    message: String,
    retryable: bool,
}

impl JobFailure {
    fn unrecoverable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

fn classify_collaborator_error(error: CollaboratorError) -> JobFailure {
    JobFailure {
        code: error.code(),
        retryable: error.is_retryable(),
        message: error.to_string(),
    }
}

fn classify_store_error(error: StoreError) -> JobFailure {
    match error {
        StoreError::NotFound(id) => {
            JobFailure::unrecoverable(ErrorCode::JobNotFound, format!("job {id} not found"))
        }
        other => JobFailure::retryable(ErrorCode::Unknown, other.to_string()),
    }
}

/// Everything a job attempt needs to talk to the outside world. Cloned
/// cheaply (every field is an `Arc`) so each spawned attempt owns its copy.
#[derive(Clone)]
pub struct JobProcessor {
    pub store: Arc<dyn JobStore>,
    pub blob: Arc<dyn BlobStore>,
    pub bus: Arc<EventBus>,
    pub ocr: Arc<dyn OcrCollaborator>,
    pub llm: Arc<dyn LlmCollaborator>,
    pub schemas: Arc<dyn SchemaRegistry>,
    pub http: reqwest::Client,
}

enum AttemptOutcome {
    Success,
    Retryable(JobFailure),
    Unrecoverable(JobFailure),
}

impl JobProcessor {
    async fn run_attempt(&self, job_id: &JobId) -> AttemptOutcome {
        match self.try_process(job_id).await {
            Ok(()) => AttemptOutcome::Success,
            Err(failure) if failure.retryable => AttemptOutcome::Retryable(failure),
            Err(failure) => AttemptOutcome::Unrecoverable(failure),
        }
    }

    /// Load the job, fetch its bytes, OCR, optionally extract, persist the result.
    async fn try_process(&self, job_id: &JobId) -> Result<(), JobFailure> {
        let job = self.store.get(job_id).await.map_err(classify_store_error)?;

        if job.status.is_terminal() {
            // A sibling attempt (or a duplicate delivery) already finished this
            // job; nothing left to do. At-least-once delivery, not exactly-once.
            return Ok(());
        }

        if job.status == JobStatus::Pending {
            self.store
                .update(
                    job_id,
                    JobPatch {
                        status: Some(JobStatus::Processing),
                        started_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(classify_store_error)?;
            self.bus
                .publish(Event::Status {
                    job_id: job_id.clone(),
                    data: StatusData {
                        status: JobStatus::Processing,
                    },
                })
                .await;
        }

        let job = self.store.get(job_id).await.map_err(classify_store_error)?;

        let (markdown, _page_count) = match job.markdown_result.clone() {
            // OCR already ran to completion on a prior attempt that then
            // failed downstream; don't pay for it twice.
            Some(markdown) => (markdown, job.page_count.unwrap_or_default()),
            None => self.run_ocr(&job).await?,
        };

        match job.job_type {
            JobType::Parse => self.finish_parse(job_id).await,
            JobType::Extract => self.finish_extract(job_id, &job, &markdown).await,
        }
    }

    async fn run_ocr(&self, job: &Job) -> Result<(String, i32), JobFailure> {
        let (bytes, mime_type) = self.fetch_bytes(job).await?;
        let output = self
            .ocr
            .recognize(bytes, &mime_type)
            .await
            .map_err(classify_collaborator_error)?;

        self.store
            .update(
                &job.id,
                JobPatch {
                    markdown_result: Some(output.markdown.clone()),
                    page_count: Some(output.page_count),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify_store_error)?;

        Ok((output.markdown, output.page_count))
    }

    /// Obtains input bytes per step 3: read the blob if `blobKey` is set,
    /// otherwise fetch `sourceUrl`, otherwise fail unrecoverably.
    async fn fetch_bytes(&self, job: &Job) -> Result<(Bytes, String), JobFailure> {
        if let Some(blob_key) = job.source.blob_key() {
            let bytes = self
                .blob
                .get(blob_key)
                .await
                .map_err(|e| JobFailure::retryable(ErrorCode::FetchFailed, e.to_string()))?;
            let mime_type = job
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_owned());
            return Ok((bytes, mime_type));
        }

        let Some(url) = job.source.source_url() else {
            return Err(JobFailure::unrecoverable(
                ErrorCode::NoSource,
                "neither blobKey nor sourceUrl is present on this job",
            ));
        };

        let response = self.http.get(url).send().await.map_err(|e| {
            // DNS failures, connect resets, and timeouts all surface here as
            // transport errors; treat all of them as retryable.
            JobFailure::retryable(ErrorCode::FetchFailed, e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let retryable = matches!(status.as_u16(), 429 | 502 | 503 | 504);
            return Err(JobFailure {
                code: ErrorCode::FetchFailed,
                message: format!("url fetch returned non-2xx status {status}"),
                retryable,
            });
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_owned());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobFailure::retryable(ErrorCode::FetchFailed, e.to_string()))?;

        let mut patch = JobPatch {
            file_size: Some(bytes.len() as i64),
            ..Default::default()
        };
        if let Some(mime_type) = &mime_type {
            patch.mime_type = Some(mime_type.clone());
        }
        self.store
            .update(&job.id, patch)
            .await
            .map_err(classify_store_error)?;

        let mime_type = mime_type
            .or_else(|| job.mime_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        Ok((bytes, mime_type))
    }

    async fn finish_parse(&self, job_id: &JobId) -> Result<(), JobFailure> {
        let job = self.store.get(job_id).await.map_err(classify_store_error)?;
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let completed_at = Utc::now();
        let processing_time_ms = (completed_at - started_at).num_milliseconds();

        self.store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    processing_time_ms: Some(processing_time_ms),
                    completed_at: Some(completed_at),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify_store_error)?;

        let completed = self.store.get(job_id).await.map_err(classify_store_error)?;
        self.bus
            .publish(Event::Completed {
                job_id: job_id.clone(),
                data: CompletedData {
                    status: JobStatus::Completed,
                    markdown_result: completed.markdown_result,
                    json_result: None,
                    processing_time_ms: completed.processing_time_ms,
                },
            })
            .await;
        Ok(())
    }

    async fn finish_extract(
        &self,
        job_id: &JobId,
        job: &Job,
        markdown: &str,
    ) -> Result<(), JobFailure> {
        let schema_ref = job.schema_ref.clone().ok_or_else(|| {
            JobFailure::unrecoverable(ErrorCode::SchemaNotFound, "extract job has no schemaRef")
        })?;
        let resolved = schema::from_external_builder(self.schemas.as_ref(), &schema_ref)
            .await
            .map_err(classify_collaborator_error)?;

        if job.status != JobStatus::Extracting {
            self.store
                .update(
                    job_id,
                    JobPatch {
                        status: Some(JobStatus::Extracting),
                        ..Default::default()
                    },
                )
                .await
                .map_err(classify_store_error)?;
            self.bus
                .publish(Event::Status {
                    job_id: job_id.clone(),
                    data: StatusData {
                        status: JobStatus::Extracting,
                    },
                })
                .await;
        }

        let output = self
            .llm
            .extract(markdown, &resolved, job.hints.as_deref())
            .await
            .map_err(classify_collaborator_error)?;

        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let completed_at = Utc::now();
        let processing_time_ms = (completed_at - started_at).num_milliseconds();

        self.store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    json_result: Some(output.json),
                    llm_model: Some(output.model),
                    token_count: Some(output.token_count),
                    processing_time_ms: Some(processing_time_ms),
                    completed_at: Some(completed_at),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify_store_error)?;

        let completed = self.store.get(job_id).await.map_err(classify_store_error)?;
        self.bus
            .publish(Event::Completed {
                job_id: job_id.clone(),
                data: CompletedData {
                    status: JobStatus::Completed,
                    markdown_result: completed.markdown_result,
                    json_result: completed.json_result,
                    processing_time_ms: completed.processing_time_ms,
                },
            })
            .await;
        Ok(())
    }

    async fn fail_terminally(&self, job_id: &JobId, failure: &JobFailure) {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            error_code: Some(failure.code),
            error_message: Some(failure.message.clone()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(error) = self.store.update(job_id, patch).await {
            tracing::error!(job_id = %job_id, %error, "failed to persist terminal failure");
            return;
        }
        self.bus
            .publish(Event::Error {
                job_id: job_id.clone(),
                data: ocrbase_common::job::ErrorData {
                    status: Some(JobStatus::Failed),
                    error: failure.message.clone(),
                },
            })
            .await;
    }

    /// Writes the most recent error without moving the job out of its
    /// non-terminal status; the Queue's terminal-failure callback is what
    /// eventually flips `status` to `failed`.
    async fn record_attempt_error(&self, job_id: &JobId, failure: &JobFailure) {
        let patch = JobPatch {
            error_code: Some(failure.code),
            error_message: Some(failure.message.clone()),
            ..Default::default()
        };
        if let Err(error) = self.store.update(job_id, patch).await {
            tracing::warn!(job_id = %job_id, %error, "failed to record attempt error");
        }
    }
}

/// Polls the Queue and drives up to `max_concurrent_jobs` job attempts in
/// parallel, mirroring the semaphore-gated pool in this codebase's other
/// worker binaries.
#[derive(Clone)]
pub struct JobWorker {
    name: String,
    queue: Arc<dyn Queue>,
    processor: JobProcessor,
    poll_interval: Duration,
    attempt_deadline: Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl JobWorker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn Queue>,
        processor: JobProcessor,
        poll_interval: Duration,
        attempt_deadline: Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            processor,
            poll_interval,
            attempt_deadline,
            max_concurrent_jobs,
            liveness,
        }
    }

    pub async fn run(&self) -> ! {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;
            metrics::gauge!("ocrbase_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );

            match self.queue.dequeue(&self.name).await {
                Ok(Some(delivery)) => {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore has been closed");
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.handle_delivery(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(%error, "queue dequeue failed, backing off");
                }
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let job_id = delivery.item.job_id.clone();
        let labels = [("queue", self.name.clone())];
        metrics::counter!("ocrbase_job_attempts_total", &labels).increment(1);

        let outcome = match tokio::time::timeout(
            self.attempt_deadline,
            self.processor.run_attempt(&job_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Retryable(JobFailure::retryable(
                ErrorCode::Timeout,
                format!("attempt exceeded the {:?} deadline", self.attempt_deadline),
            )),
        };

        match outcome {
            AttemptOutcome::Success => {
                metrics::counter!("ocrbase_jobs_completed_total", &labels).increment(1);
                let _ = self.queue.ack(delivery.delivery_id).await;
            }
            AttemptOutcome::Retryable(failure) => {
                self.processor.record_attempt_error(&job_id, &failure).await;
                match self.queue.retry(delivery.delivery_id, None).await {
                    Ok(true) => {
                        metrics::counter!("ocrbase_jobs_retried_total", &labels).increment(1);
                    }
                    Ok(false) | Err(_) => {
                        metrics::counter!("ocrbase_jobs_failed_total", &labels).increment(1);
                        self.processor.fail_terminally(&job_id, &failure).await;
                    }
                }
            }
            AttemptOutcome::Unrecoverable(failure) => {
                metrics::counter!("ocrbase_jobs_failed_total", &labels).increment(1);
                let _ = self.queue.fail(delivery.delivery_id).await;
                self.processor.fail_terminally(&job_id, &failure).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as TestBytes;
    use ocrbase_common::blob::ObjectStoreBlobStore;
    use ocrbase_common::collaborators::{LlmOutput, OcrOutput};
    use ocrbase_common::job::{JobSource, JobType};
    use ocrbase_common::schema::{ResolvedSchema, SchemaRegistry as _};
    use ocrbase_common::store::PgJobStore;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct StubOcr {
        result: Result<OcrOutput, CollaboratorError>,
    }

    #[async_trait::async_trait]
    impl OcrCollaborator for StubOcr {
        async fn recognize(&self, _bytes: Bytes, _mime: &str) -> Result<OcrOutput, CollaboratorError> {
            match &self.result {
                Ok(output) => Ok(output.clone()),
                Err(_) => Err(CollaboratorError::OcrTransient("stub failure".into())),
            }
        }
    }

    struct StubLlm;

    #[async_trait::async_trait]
    impl LlmCollaborator for StubLlm {
        async fn extract(
            &self,
            _markdown: &str,
            _schema: &ResolvedSchema,
            _hints: Option<&str>,
        ) -> Result<LlmOutput, CollaboratorError> {
            Ok(LlmOutput {
                json: serde_json::json!({"total": 1}),
                model: "stub-model".into(),
                token_count: 5,
            })
        }
    }

    struct StubRegistry(Mutex<BTreeMap<String, serde_json::Value>>);

    #[async_trait::async_trait]
    impl SchemaRegistry for StubRegistry {
        async fn lookup(&self, reference: &str) -> Result<Option<serde_json::Value>, CollaboratorError> {
            Ok(self.0.lock().unwrap().get(reference).cloned())
        }

        async fn register(
            &self,
            _reference: &str,
            _document: serde_json::Value,
        ) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    fn sample_job(job_type: JobType, blob_key: &str) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            tenant_id: "tenant_1".into(),
            job_type,
            status: JobStatus::Pending,
            source: JobSource::Blob {
                blob_key: blob_key.into(),
            },
            file_name: Some("doc.pdf".into()),
            mime_type: Some("application/pdf".into()),
            file_size: Some(10),
            schema_ref: Some("schema_1".into()),
            hints: None,
            markdown_result: None,
            json_result: None,
            error_code: None,
            error_message: None,
            attempts_made: 0,
            max_attempts: 3,
            processing_time_ms: None,
            page_count: None,
            llm_model: None,
            token_count: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn parse_job_completes_with_markdown(pool: sqlx::PgPool) {
        let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
        let blob = Arc::new(ObjectStoreBlobStore::in_memory());
        blob.put("tenant_1/jobs/x/doc.pdf", TestBytes::from_static(b"%PDF"))
            .await
            .unwrap();

        let job = sample_job(JobType::Parse, "tenant_1/jobs/x/doc.pdf");
        let job_id = job.id.clone();
        store.create(job).await.unwrap();

        let processor = JobProcessor {
            store: store.clone(),
            blob,
            bus: EventBus::new(),
            ocr: Arc::new(StubOcr {
                result: Ok(OcrOutput {
                    markdown: "# Hello".into(),
                    page_count: 1,
                }),
            }),
            llm: Arc::new(StubLlm),
            schemas: Arc::new(StubRegistry(Mutex::new(BTreeMap::new()))),
            http: reqwest::Client::new(),
        };

        processor.try_process(&job_id).await.unwrap();

        let completed = store.get(&job_id).await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.markdown_result.as_deref(), Some("# Hello"));
        assert!(completed.json_result.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn extract_job_completes_with_json(pool: sqlx::PgPool) {
        let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
        let blob = Arc::new(ObjectStoreBlobStore::in_memory());
        blob.put("tenant_1/jobs/y/doc.pdf", TestBytes::from_static(b"%PDF"))
            .await
            .unwrap();

        let mut job = sample_job(JobType::Extract, "tenant_1/jobs/y/doc.pdf");
        job.schema_ref = Some("schema_1".into());
        let job_id = job.id.clone();
        store.create(job).await.unwrap();

        let mut registry = BTreeMap::new();
        registry.insert(
            "schema_1".to_owned(),
            serde_json::json!({"type": "object", "required": ["total"]}),
        );

        let processor = JobProcessor {
            store: store.clone(),
            blob,
            bus: EventBus::new(),
            ocr: Arc::new(StubOcr {
                result: Ok(OcrOutput {
                    markdown: "total: 1".into(),
                    page_count: 1,
                }),
            }),
            llm: Arc::new(StubLlm),
            schemas: Arc::new(StubRegistry(Mutex::new(registry))),
            http: reqwest::Client::new(),
        };

        processor.try_process(&job_id).await.unwrap();

        let completed = store.get(&job_id).await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.json_result.unwrap()["total"], 1);
        assert_eq!(completed.llm_model.as_deref(), Some("stub-model"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn missing_job_is_unrecoverable(pool: sqlx::PgPool) {
        let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
        let processor = JobProcessor {
            store,
            blob: Arc::new(ObjectStoreBlobStore::in_memory()),
            bus: EventBus::new(),
            ocr: Arc::new(StubOcr {
                result: Err(CollaboratorError::OcrTransient("n/a".into())),
            }),
            llm: Arc::new(StubLlm),
            schemas: Arc::new(StubRegistry(Mutex::new(BTreeMap::new()))),
            http: reqwest::Client::new(),
        };

        let outcome = processor.run_attempt(&JobId::new()).await;
        assert!(matches!(outcome, AttemptOutcome::Unrecoverable(_)));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn record_attempt_error_persists_while_job_stays_non_terminal(pool: sqlx::PgPool) {
        let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
        let job = sample_job(JobType::Parse, "tenant_1/jobs/z/doc.pdf");
        let job_id = job.id.clone();
        store.create(job).await.unwrap();
        store
            .update(
                &job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let processor = JobProcessor {
            store: store.clone(),
            blob: Arc::new(ObjectStoreBlobStore::in_memory()),
            bus: EventBus::new(),
            ocr: Arc::new(StubOcr {
                result: Err(CollaboratorError::OcrTransient("n/a".into())),
            }),
            llm: Arc::new(StubLlm),
            schemas: Arc::new(StubRegistry(Mutex::new(BTreeMap::new()))),
            http: reqwest::Client::new(),
        };

        let failure = JobFailure::retryable(ErrorCode::OcrFailed, "transient OCR hiccup");
        processor.record_attempt_error(&job_id, &failure).await;

        let reloaded = store.get(&job_id).await.unwrap();
        assert_eq!(reloaded.status, JobStatus::Processing);
        assert_eq!(reloaded.error_code, Some(ErrorCode::OcrFailed));
        assert_eq!(reloaded.error_message.as_deref(), Some("transient OCR hiccup"));
    }
}
