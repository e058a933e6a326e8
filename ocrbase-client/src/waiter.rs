//! The Client Waiter: a single `wait_for_completion`
//! call that opens a realtime stream to the Gateway, tolerates reconnects,
//! and surfaces exactly one terminal result or a typed error.

use std::time::Duration;

use serde::Serialize;

use ocrbase_common::job::{CompletedData, Event, Job, JobId, JobStatus};

use crate::config::WaiterConfig;
use crate::error::ClientError;
use crate::sse::SseDecoder;

/// The terminal payload handed back to SDK consumers. Built from the
/// `completed` event, optionally enriched by one post-terminal snapshot read.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub markdown_result: Option<String>,
    pub json_result: Option<serde_json::Value>,
    pub processing_time_ms: Option<i64>,
    pub page_count: Option<i32>,
    pub llm_model: Option<String>,
    pub token_count: Option<i64>,
}

impl TerminalResult {
    fn from_completed(job_id: JobId, data: CompletedData) -> Self {
        Self {
            job_id,
            status: data.status,
            markdown_result: data.markdown_result,
            json_result: data.json_result,
            processing_time_ms: data.processing_time_ms,
            page_count: None,
            llm_model: None,
            token_count: None,
        }
    }

    fn backfill(&mut self, job: &Job) {
        self.page_count = self.page_count.or(job.page_count);
        self.llm_model = self.llm_model.clone().or_else(|| job.llm_model.clone());
        self.token_count = self.token_count.or(job.token_count);
        self.processing_time_ms = self.processing_time_ms.or(job.processing_time_ms);
        if self.markdown_result.is_none() {
            self.markdown_result = job.markdown_result.clone();
        }
        if self.json_result.is_none() {
            self.json_result = job.json_result.clone();
        }
    }
}

/// Thin HTTP client binding to one ocrbase deployment. Opens realtime
/// streams against `GET /v1/realtime` and snapshots against
/// `GET /v1/jobs/{id}`, the two endpoints the Client Waiter needs out of the
/// six the Submission API exposes.
pub struct OcrbaseClient {
    http: reqwest::Client,
    base_url: String,
    credential: String,
    waiter: WaiterConfig,
}

impl OcrbaseClient {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self::with_config(base_url, credential, WaiterConfig::default())
    }

    pub fn with_config(
        base_url: impl Into<String>,
        credential: impl Into<String>,
        waiter: WaiterConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credential: credential.into(),
            waiter,
        }
    }

    /// Fetches a point-in-time Job Store snapshot via `GET /v1/jobs/{id}`.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/jobs/{}", self.base_url, job_id.0))
            .bearer_auth(&self.credential)
            .send()
            .await?;
        self.into_json(response).await
    }

    async fn into_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Server {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(ClientError::Transport)
    }

    /// Open a stream, resolve on `completed`,
    /// reject on a `failed` `error` event, and reconnect with backoff on
    /// any transport failure until `max_reconnect_attempts` is exhausted.
    pub async fn wait_for_completion(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<TerminalResult, ClientError> {
        match tokio::time::timeout(timeout, self.wait_with_reconnect(job_id)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(job_id.0.clone())),
        }
    }

    async fn wait_with_reconnect(&self, job_id: &JobId) -> Result<TerminalResult, ClientError> {
        let policy = self.waiter.retry_policy();
        let mut attempt = 0u32;

        loop {
            match self.wait_once(job_id).await {
                Ok(Some(mut result)) => {
                    if self.waiter.backfill_from_snapshot {
                        if let Ok(job) = self.get_job(job_id).await {
                            result.backfill(&job);
                        }
                    }
                    return Ok(result);
                }
                Ok(None) => {
                    // Stream closed (or errored transport-side, distinct
                    // from a job failure) before a terminal event arrived:
                    // treat this the same as a transport error and reconnect.
                }
                Err(error @ ClientError::JobFailed { .. }) => return Err(error),
                Err(_transport_error) => {}
            }

            attempt += 1;
            if attempt >= self.waiter.max_reconnect_attempts {
                return Err(ClientError::RealtimeUnavailable { attempts: attempt });
            }
            tokio::time::sleep(policy.time_until_next_retry(attempt - 1, None)).await;
        }
    }

    /// Runs one subscribe attempt to completion: either a terminal event is
    /// observed (`Ok(Some(_))` for completed, `Err(JobFailed)` for failed),
    /// or the stream ends / errors without one (`Ok(None)`).
    async fn wait_once(&self, job_id: &JobId) -> Result<Option<TerminalResult>, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/realtime", self.base_url))
            .query(&[("job_id", job_id.0.as_str())])
            .bearer_auth(&self.credential)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Server { status, body });
        }

        let mut decoder = SseDecoder::new(response.bytes_stream());

        loop {
            let Some(message) = decoder.next_message().await? else {
                return Ok(None);
            };

            let event: Event = serde_json::from_str(&message.data)
                .map_err(|e| ClientError::MalformedEvent(e.to_string()))?;

            match event {
                Event::Completed { job_id, data } => {
                    return Ok(Some(TerminalResult::from_completed(job_id, data)));
                }
                Event::Error { job_id, data } => {
                    if data.status == Some(JobStatus::Failed) {
                        return Err(ClientError::JobFailed {
                            job_id: job_id.0,
                            error_code: None,
                            message: data.error,
                        });
                    }
                    // Transport-level error from the Gateway (bus
                    // unavailable): not a job failure, reconnect instead.
                    return Ok(None);
                }
                Event::Status { .. } | Event::Pong { .. } => continue,
            }
        }
    }
}
