//! The Queue: a durable FIFO of Work Items with retry, delay, and attempt
//! bookkeeping, backed by a `work_items` table. Dequeue uses the same
//! `FOR UPDATE SKIP LOCKED` pattern as the job queue this crate grew out of,
//! so multiple worker processes can pull concurrently without double
//! delivery.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use std::time::Duration as StdDuration;

use crate::error::QueueError;
use crate::job::{JobId, WorkItem};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EnqueueOpts {
    pub max_attempts: i32,
    pub backoff: RetryPolicy,
    /// When set, a second `enqueue` with the same key is a no-op instead of
    /// inserting a second Work Item — this is what makes the presigned
    /// upload flow's `confirm` idempotent against double-enqueue.
    pub dedup_key: Option<String>,
}

impl Default for EnqueueOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetryPolicy::default(),
            dedup_key: None,
        }
    }
}

/// A Work Item handed to a worker, carrying enough queue-side bookkeeping
/// to ack/retry/fail it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub item: WorkItem,
    pub attempt: i32,
    pub max_attempts: i32,
}

#[derive(FromRow)]
struct WorkItemRow {
    id: i64,
    job_id: String,
    tenant_id: String,
    submitter_id: String,
    request_id: Option<String>,
    attempt: i32,
    max_attempts: i32,
}

impl WorkItemRow {
    fn into_delivery(self) -> Delivery {
        Delivery {
            delivery_id: self.id,
            item: WorkItem {
                job_id: JobId(self.job_id),
                tenant_id: self.tenant_id,
                submitter_id: self.submitter_id,
                request_id: self.request_id,
            },
            attempt: self.attempt,
            max_attempts: self.max_attempts,
        }
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, item: WorkItem, opts: EnqueueOpts) -> Result<(), QueueError>;

    /// Atomically claims the oldest available Work Item for `worker_name`,
    /// or `None` if the queue is empty. Safe to call concurrently from many
    /// worker processes: the claim is exclusive per the Queue's guarantee.
    async fn dequeue(&self, worker_name: &str) -> Result<Option<Delivery>, QueueError>;

    /// Marks a Work Item's job as done; removes it from future dequeues.
    async fn ack(&self, delivery_id: i64) -> Result<(), QueueError>;

    /// Re-enqueues with a computed backoff delay, or fails it terminally if
    /// attempts are exhausted. Returns `true` if the item was re-enqueued,
    /// `false` if it was exhausted and handed to the terminal-failure path.
    async fn retry(
        &self,
        delivery_id: i64,
        preferred_retry_interval: Option<StdDuration>,
    ) -> Result<bool, QueueError>;

    /// Immediately marks a Work Item as terminally failed, regardless of
    /// remaining attempts (used for unrecoverable collaborator errors).
    async fn fail(&self, delivery_id: i64) -> Result<(), QueueError>;
}

pub struct PgQueue {
    pool: PgPool,
    queue_name: String,
}

impl PgQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn enqueue(&self, item: WorkItem, opts: EnqueueOpts) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO work_items (
                job_id, tenant_id, submitter_id, request_id, dedup_key,
                queue, status, attempt, max_attempts, scheduled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'available', 0, $7, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&item.job_id.0)
        .bind(&item.tenant_id)
        .bind(&item.submitter_id)
        .bind(&item.request_id)
        .bind(&opts.dedup_key)
        .bind(&self.queue_name)
        .bind(opts.max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dequeue(&self, worker_name: &str) -> Result<Option<Delivery>, QueueError> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            WITH available AS (
                SELECT id FROM work_items
                WHERE status = 'available' AND scheduled_at <= NOW() AND queue = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items
            SET status = 'running', attempt = work_items.attempt + 1,
                attempted_at = NOW(),
                attempted_by = array_append(work_items.attempted_by, $2::text)
            FROM available
            WHERE work_items.id = available.id
            RETURNING work_items.id, work_items.job_id, work_items.tenant_id,
                      work_items.submitter_id, work_items.request_id,
                      work_items.attempt, work_items.max_attempts
            "#,
        )
        .bind(&self.queue_name)
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let work_item = WorkItemRow::from_row(&row).map_err(QueueError::Database)?;
        Ok(Some(work_item.into_delivery()))
    }

    async fn ack(&self, delivery_id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE work_items SET status = 'completed' WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        delivery_id: i64,
        preferred_retry_interval: Option<StdDuration>,
    ) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT attempt, max_attempts FROM work_items WHERE id = $1")
            .bind(delivery_id)
            .fetch_one(&self.pool)
            .await?;
        let attempt: i32 = row.try_get("attempt")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        if attempt >= max_attempts {
            self.fail(delivery_id).await?;
            return Ok(false);
        }

        let backoff = RetryPolicy::default();
        let delay = backoff.time_until_next_retry(attempt as u32, preferred_retry_interval);
        sqlx::query(
            "UPDATE work_items SET status = 'available', scheduled_at = NOW() + make_interval(secs => $2) WHERE id = $1",
        )
        .bind(delivery_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn fail(&self, delivery_id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE work_items SET status = 'failed' WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobSource, JobStatus, JobType};
    use crate::store::{JobStore, PgJobStore};
    use chrono::Utc;

    fn sample_job(id: &JobId) -> Job {
        let now = Utc::now();
        Job {
            id: id.clone(),
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

    #[sqlx::test(migrations = "../migrations")]
    async fn enqueue_then_dequeue_claims_exactly_once(pool: PgPool) {
        let store = PgJobStore::new(pool.clone());
        let job_id = JobId::new();
        store.create(sample_job(&job_id)).await.unwrap();

        let queue = PgQueue::new(pool, "default");
        let item = WorkItem {
            job_id: job_id.clone(),
            tenant_id: "tenant_1".into(),
            submitter_id: "user_1".into(),
            request_id: None,
        };
        queue.enqueue(item, EnqueueOpts::default()).await.unwrap();

        let first = queue.dequeue("worker-a").await.unwrap();
        assert!(first.is_some());
        let second = queue.dequeue("worker-b").await.unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn dedup_key_prevents_double_enqueue(pool: PgPool) {
        let store = PgJobStore::new(pool.clone());
        let job_id = JobId::new();
        store.create(sample_job(&job_id)).await.unwrap();

        let queue = PgQueue::new(pool, "default");
        let item = WorkItem {
            job_id: job_id.clone(),
            tenant_id: "tenant_1".into(),
            submitter_id: "user_1".into(),
            request_id: None,
        };
        let opts = EnqueueOpts {
            dedup_key: Some(job_id.0.clone()),
            ..EnqueueOpts::default()
        };
        queue.enqueue(item.clone(), opts.clone()).await.unwrap();
        queue.enqueue(item, opts).await.unwrap();

        let first = queue.dequeue("worker-a").await.unwrap();
        assert!(first.is_some());
        let second = queue.dequeue("worker-a").await.unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn retry_exhausting_attempts_reports_terminal(pool: PgPool) {
        let store = PgJobStore::new(pool.clone());
        let job_id = JobId::new();
        store.create(sample_job(&job_id)).await.unwrap();

        let queue = PgQueue::new(pool, "default");
        let item = WorkItem {
            job_id: job_id.clone(),
            tenant_id: "tenant_1".into(),
            submitter_id: "user_1".into(),
            request_id: None,
        };
        let opts = EnqueueOpts {
            max_attempts: 1,
            ..EnqueueOpts::default()
        };
        queue.enqueue(item, opts).await.unwrap();

        let delivery = queue.dequeue("worker-a").await.unwrap().unwrap();
        let retried = queue.retry(delivery.delivery_id, None).await.unwrap();
        assert!(!retried);
    }
}
