use std::time::Duration;

use ocrbase_common::retry::RetryPolicy;

/// Reconnection policy for the Client Waiter.
/// Plain `Default`-constructible config, not `envconfig`-derived: this crate
/// is an SDK embedded in caller processes, not a standalone binary reading
/// its own environment.
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    /// Reconnect attempts after a transport error, timeout, or a connection
    /// that closes before a terminal event. Exhausting these surfaces
    /// `ClientError::RealtimeUnavailable`.
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_coefficient: u32,
    /// Whether to fetch one Job snapshot after a terminal event to backfill
    /// fields the event payload omits (`pageCount`, `llmModel`, …).
    pub backfill_from_snapshot: bool,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_coefficient: 2,
            backfill_from_snapshot: true,
        }
    }
}

impl WaiterConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_backoff,
            Some(self.max_backoff),
        )
    }
}
