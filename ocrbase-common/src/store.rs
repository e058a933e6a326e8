//! The Job Store: durable record of every job, keyed by id, with
//! tenant-scoped listing and soft delete.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::job::{Job, JobId, JobListFilter, JobPatch, JobStatus, JobType, Page};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<Job, StoreError>;
    async fn get(&self, id: &JobId) -> Result<Job, StoreError>;
    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Job, StoreError>;
    async fn list(&self, filter: JobListFilter, page: Page) -> Result<Vec<Job>, StoreError>;
    /// Marks a job as deleted without removing the row; the Realtime
    /// Gateway and Submission API both treat a soft-deleted job as
    /// `JobNotFound` from this point on.
    async fn soft_delete(&self, id: &JobId) -> Result<(), StoreError>;
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let source_json = serde_json::to_value(&job.source)
            .map_err(|e| StoreError::Connection(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, job_type, status, source, file_name, mime_type,
                file_size, schema_ref, hints, attempts_made, max_attempts,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&job.id.0)
        .bind(&job.tenant_id)
        .bind(job.job_type)
        .bind(job.status)
        .bind(&source_json)
        .bind(&job.file_name)
        .bind(&job.mime_type)
        .bind(job.file_size)
        .bind(&job.schema_ref)
        .bind(&job.hints)
        .bind(job.attempts_made)
        .bind(job.max_attempts)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        let row: JobRow = sqlx::query_as(SELECT_JOB_COLUMNS_WHERE_ID)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;

        row.try_into_job()
    }

    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing: JobRow = sqlx::query_as(SELECT_JOB_COLUMNS_WHERE_ID_FOR_UPDATE)
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))?;
        let existing = existing.try_into_job()?;

        let merged = merge_patch(existing, patch);
        merged
            .check_invariants()
            .map_err(|_| StoreError::NotFound(id.0.clone()))?;

        let source_json = serde_json::to_value(&merged.source)
            .map_err(|e| StoreError::Connection(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, source = $3, mime_type = $4, file_size = $5,
                markdown_result = $6, json_result = $7, error_code = $8,
                error_message = $9, attempts_made = $10, processing_time_ms = $11,
                page_count = $12, llm_model = $13, token_count = $14,
                started_at = $15, completed_at = $16, updated_at = $17
            WHERE id = $1
            "#,
        )
        .bind(&merged.id.0)
        .bind(merged.status)
        .bind(&source_json)
        .bind(&merged.mime_type)
        .bind(merged.file_size)
        .bind(&merged.markdown_result)
        .bind(&merged.json_result)
        .bind(merged.error_code.map(|c| c.to_string()))
        .bind(&merged.error_message)
        .bind(merged.attempts_made)
        .bind(merged.processing_time_ms)
        .bind(merged.page_count)
        .bind(&merged.llm_model)
        .bind(merged.token_count)
        .bind(merged.started_at)
        .bind(merged.completed_at)
        .bind(merged.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(merged)
    }

    async fn list(&self, filter: JobListFilter, page: Page) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT
                id, tenant_id, job_type, status,
                source, file_name, mime_type, file_size, schema_ref, hints,
                markdown_result, json_result, error_code,
                error_message, attempts_made, max_attempts, processing_time_ms,
                page_count, llm_model, token_count, created_at, started_at,
                completed_at, updated_at, deleted_at
            FROM jobs
            WHERE deleted_at IS NULL
              AND ($1::text IS NULL OR tenant_id = $1)
              AND ($2::job_status IS NULL OR status = $2)
              AND ($3::job_type IS NULL OR job_type = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(&filter.tenant_id)
        .bind(filter.status)
        .bind(filter.job_type)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn soft_delete(&self, id: &JobId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(&id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.0.clone()));
        }
        Ok(())
    }
}

const SELECT_JOB_COLUMNS_WHERE_ID: &str = r#"
    SELECT
        id, tenant_id, job_type, status,
        source, file_name, mime_type, file_size, schema_ref, hints,
        markdown_result, json_result, error_code,
        error_message, attempts_made, max_attempts, processing_time_ms,
        page_count, llm_model, token_count, created_at, started_at,
        completed_at, updated_at, deleted_at
    FROM jobs WHERE id = $1 AND deleted_at IS NULL
"#;

const SELECT_JOB_COLUMNS_WHERE_ID_FOR_UPDATE: &str = r#"
    SELECT
        id, tenant_id, job_type, status,
        source, file_name, mime_type, file_size, schema_ref, hints,
        markdown_result, json_result, error_code,
        error_message, attempts_made, max_attempts, processing_time_ms,
        page_count, llm_model, token_count, created_at, started_at,
        completed_at, updated_at, deleted_at
    FROM jobs WHERE id = $1 AND deleted_at IS NULL FOR UPDATE
"#;

/// Applies only the fields a caller set, leaving everything else as-is.
/// Keeps concurrent writers that touch disjoint fields from clobbering
/// each other, matching the Job Store's field-scoped update contract.
fn merge_patch(mut job: Job, patch: JobPatch) -> Job {
    if let Some(status) = patch.status {
        job.status = status;
    }
    if let Some(source) = patch.source {
        job.source = source;
    }
    if let Some(mime_type) = patch.mime_type {
        job.mime_type = Some(mime_type);
    }
    if let Some(file_size) = patch.file_size {
        job.file_size = Some(file_size);
    }
    if let Some(markdown_result) = patch.markdown_result {
        job.markdown_result = Some(markdown_result);
    }
    if let Some(json_result) = patch.json_result {
        job.json_result = Some(json_result);
    }
    if let Some(error_code) = patch.error_code {
        job.error_code = Some(error_code);
    }
    if let Some(error_message) = patch.error_message {
        job.error_message = Some(error_message);
    }
    if let Some(attempts_made) = patch.attempts_made {
        job.attempts_made = attempts_made;
    }
    if let Some(processing_time_ms) = patch.processing_time_ms {
        job.processing_time_ms = Some(processing_time_ms);
    }
    if let Some(page_count) = patch.page_count {
        job.page_count = Some(page_count);
    }
    if let Some(llm_model) = patch.llm_model {
        job.llm_model = Some(llm_model);
    }
    if let Some(token_count) = patch.token_count {
        job.token_count = Some(token_count);
    }
    if let Some(started_at) = patch.started_at {
        job.started_at = Some(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        job.completed_at = Some(completed_at);
    }
    job.updated_at = Utc::now();
    job
}

/// Mirrors the `jobs` table's column shapes for `query_as`; `try_into_job`
/// does the one fallible conversion (the `source` jsonb column).
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    tenant_id: String,
    job_type: JobType,
    status: JobStatus,
    source: serde_json::Value,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<i64>,
    schema_ref: Option<String>,
    hints: Option<String>,
    markdown_result: Option<String>,
    json_result: Option<serde_json::Value>,
    error_code: Option<String>,
    error_message: Option<String>,
    attempts_made: i32,
    max_attempts: i32,
    processing_time_ms: Option<i64>,
    page_count: Option<i32>,
    llm_model: Option<String>,
    token_count: Option<i64>,
    created_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    updated_at: chrono::DateTime<Utc>,
    deleted_at: Option<chrono::DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job, StoreError> {
        use std::str::FromStr;

        let source = serde_json::from_value(self.source)
            .map_err(|e| StoreError::Connection(sqlx::Error::Decode(Box::new(e))))?;
        let error_code = self
            .error_code
            .map(|s| crate::error::ErrorCode::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Connection(sqlx::Error::Decode(e.into())))?;
        Ok(Job {
            id: JobId(self.id),
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            status: self.status,
            source,
            file_name: self.file_name,
            mime_type: self.mime_type,
            file_size: self.file_size,
            schema_ref: self.schema_ref,
            hints: self.hints,
            markdown_result: self.markdown_result,
            json_result: self.json_result,
            error_code,
            error_message: self.error_message,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            processing_time_ms: self.processing_time_ms,
            page_count: self.page_count,
            llm_model: self.llm_model,
            token_count: self.token_count,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSource;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            tenant_id: "tenant_1".into(),
            job_type: JobType::Parse,
            status: JobStatus::Pending,
            source: JobSource::Url {
                source_url: "https://example.com/doc.pdf".into(),
            },
            file_name: None,
            mime_type: None,
            file_size: None,
            schema_ref: None,
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

    #[test]
    fn merge_patch_only_touches_set_fields() {
        let job = sample_job();
        let original_tenant = job.tenant_id.clone();
        let patched = merge_patch(job, JobPatch::default().status(JobStatus::Processing));
        assert_eq!(patched.status, JobStatus::Processing);
        assert_eq!(patched.tenant_id, original_tenant);
        assert!(patched.markdown_result.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn create_then_get_round_trips(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let job = sample_job();
        let created = store.create(job.clone()).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn get_after_soft_delete_reports_not_found(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let created = store.create(sample_job()).await.unwrap();
        store.soft_delete(&created.id).await.unwrap();
        let err = store.get(&created.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn update_rejects_patch_that_breaks_invariants(pool: PgPool) {
        let store = PgJobStore::new(pool);
        let created = store.create(sample_job()).await.unwrap();
        let err = store
            .update(&created.id, JobPatch::default().status(JobStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
