//! The Event Bus: a logical per-job ordered channel publishing `Event`s to
//! every subscriber currently bound at the moment of publish. Ref-counted
//! fan-out so multiple Realtime Gateway connections for the same job share
//! one upstream subscription.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Notify;

use crate::job::{Event, JobId};

const CHANNEL_BUFFER_SIZE: usize = 64;
const METRIC_DROPPED_EVENTS: &str = "ocrbase_bus_dropped_events_total";

struct Channel {
    senders: Vec<Sender<Event>>,
    /// Signaled whenever a subscriber is added, so `subscribe` callers can
    /// await "readiness" per the subscribe/publish race protocol.
    ready: Arc<Notify>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            ready: Arc::new(Notify::new()),
        }
    }
}

/// In-memory ref-counted subscription registry. One process's worth of
/// subscribers; a multi-process deployment runs one Gateway replica per
/// Bus instance and relies on the Job Store snapshot reconciliation in
/// `subscribe_and_reconcile` to paper over events published to a sibling
/// replica's channel.
pub struct EventBus {
    channels: RwLock<HashMap<String, Channel>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Binds a new subscriber to `job_id`'s channel and returns both the
    /// receiver and a readiness handle. The handle resolves once the
    /// subscription is registered, satisfying step (1) of the
    /// subscribe/publish race protocol.
    pub fn subscribe(&self, job_id: &JobId) -> (Receiver<Event>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let ready = {
            let mut channels = self.channels.write();
            let channel = channels.entry(job_id.0.clone()).or_default();
            channel.senders.push(tx);
            let ready = channel.ready.clone();
            ready.notify_waiters();
            ready
        };
        (rx, ready)
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.channels
            .read()
            .get(&job_id.0)
            .map(|c| c.senders.len())
            .unwrap_or(0)
    }

    /// Publishes at-least-once to every subscriber currently bound. No
    /// history is retained: a subscriber that binds after this call never
    /// sees it.
    pub async fn publish(&self, event: Event) {
        let job_id = event.job_id().0.clone();
        let senders = self.channels.read().get(&job_id).map(|c| c.senders.clone());

        let Some(senders) = senders else {
            return;
        };
        for tx in senders {
            if let Err(error) = tx.try_send(event.clone()) {
                tracing::warn!(job_id = %job_id, %error, "dropping event, subscriber channel full or closed");
                let labels = [("job_id", job_id.clone())];
                metrics::counter!(METRIC_DROPPED_EVENTS, &labels).increment(1);
            }
        }
    }

    /// Drops closed senders for `job_id`; once none remain, removes the
    /// channel entirely (the "last release unsubscribes" rule).
    pub fn cleanup_closed(&self, job_id: &JobId) {
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get_mut(&job_id.0) {
            channel.senders.retain(|tx| !tx.is_closed());
            if channel.senders.is_empty() {
                channels.remove(&job_id.0);
            }
        }
    }
}

/// Outcome of the subscribe-then-snapshot protocol.
pub enum Subscription {
    /// The job was still non-terminal at snapshot time. `initial` is a
    /// `status` event synthesized from that snapshot; callers must deliver
    /// it before forwarding anything read from `receiver`.
    Live {
        receiver: Receiver<Event>,
        initial: Event,
    },
    /// The job was already terminal by the time the snapshot was read —
    /// the channel is never consulted, closing the window where a publish
    /// between snapshot and subscribe would otherwise be lost.
    AlreadyTerminal(Event),
}

/// Binds to `job_id`'s channel and reconciles against a Job Store snapshot,
/// eliminating the race between "job completes" and "subscribe takes
/// effect". `EventBus::subscribe` registers
/// the new sender synchronously under a lock before returning, so by the
/// time this function's first snapshot read begins, any publish that comes
/// after it is guaranteed to reach `receiver` — readiness is satisfied by
/// construction, not by waiting on `Channel::ready` (kept on `Channel` for
/// a future out-of-process Bus backend where registration isn't
/// synchronous; see DESIGN.md).
pub async fn subscribe_and_reconcile(
    bus: &EventBus,
    store: &dyn crate::store::JobStore,
    job_id: &JobId,
) -> Result<Subscription, crate::error::StoreError> {
    let (receiver, _ready) = bus.subscribe(job_id);
    let job = store.get(job_id).await?;

    if let Some(event) = Event::from_terminal_snapshot(&job) {
        bus.cleanup_closed(job_id);
        return Ok(Subscription::AlreadyTerminal(event));
    }

    Ok(Subscription::Live {
        receiver,
        initial: Event::Status {
            job_id: job_id.clone(),
            data: crate::job::StatusData { status: job.status },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(job_id: &JobId) -> Event {
        Event::Status {
            job_id: job_id.clone(),
            data: crate::job::StatusData {
                status: crate::job::JobStatus::Processing,
            },
        }
    }

    #[tokio::test]
    async fn subscribe_then_publish_is_delivered() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        let (mut rx, _ready) = bus.subscribe(&job_id);
        assert_eq!(bus.subscriber_count(&job_id), 1);

        bus.publish(sample_event(&job_id)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id(), &job_id);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        let (mut rx1, _) = bus.subscribe(&job_id);
        let (mut rx2, _) = bus.subscribe(&job_id);
        assert_eq!(bus.subscriber_count(&job_id), 2);

        bus.publish(sample_event(&job_id)).await;

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_before_any_subscriber_is_a_no_op() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.publish(sample_event(&job_id)).await;
        assert_eq!(bus.subscriber_count(&job_id), 0);
    }

    #[tokio::test]
    async fn cleanup_closed_removes_empty_channel() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        let (rx, _) = bus.subscribe(&job_id);
        drop(rx);
        bus.cleanup_closed(&job_id);
        assert_eq!(bus.subscriber_count(&job_id), 0);
    }

    fn sample_job(id: &JobId, status: crate::job::JobStatus) -> crate::job::Job {
        use crate::job::{JobSource, JobType};
        let now = chrono::Utc::now();
        crate::job::Job {
            id: id.clone(),
            tenant_id: "tenant_1".into(),
            job_type: JobType::Parse,
            status,
            source: JobSource::Url {
                source_url: "https://example.com/doc.pdf".into(),
            },
            file_name: None,
            mime_type: None,
            file_size: None,
            schema_ref: None,
            hints: None,
            markdown_result: if status == crate::job::JobStatus::Completed {
                Some("# hi".into())
            } else {
                None
            },
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
    async fn reconcile_synthesizes_terminal_event_for_job_completed_before_subscribe(
        pool: sqlx::PgPool,
    ) {
        use crate::store::{JobStore, PgJobStore};

        let store = PgJobStore::new(pool);
        let job_id = JobId::new();
        store
            .create(sample_job(&job_id, crate::job::JobStatus::Completed))
            .await
            .unwrap();

        let bus = EventBus::new();
        let outcome = subscribe_and_reconcile(&bus, &store, &job_id).await.unwrap();
        match outcome {
            Subscription::AlreadyTerminal(event) => assert!(event.is_terminal()),
            Subscription::Live { .. } => panic!("expected an already-terminal reconciliation"),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn reconcile_stays_live_for_non_terminal_job(pool: sqlx::PgPool) {
        use crate::store::{JobStore, PgJobStore};

        let store = PgJobStore::new(pool);
        let job_id = JobId::new();
        store
            .create(sample_job(&job_id, crate::job::JobStatus::Processing))
            .await
            .unwrap();

        let bus = EventBus::new();
        let outcome = subscribe_and_reconcile(&bus, &store, &job_id).await.unwrap();
        match outcome {
            Subscription::Live { initial, .. } => assert!(!initial.is_terminal()),
            Subscription::AlreadyTerminal(_) => panic!("expected a live reconciliation"),
        }
    }
}
