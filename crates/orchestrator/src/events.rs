use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use labelsquor_core::Event;
use labelsquor_store::{StoreError, WorkItemStore};

use crate::metrics::OrchestratorMetrics;

/// Events fetched per delivery poll.
const DELIVERY_BATCH: usize = 100;

/// Attempts per event before the loop gives up for this poll and retries on
/// the next one. Delivery is at-least-once; subscribers are idempotent.
const DELIVERY_ATTEMPTS: u32 = 3;

/// Error returned by a subscriber that failed to handle an event.
#[derive(Debug, thiserror::Error)]
#[error("subscriber error: {0}")]
pub struct SubscriberError(pub String);

/// An in-process consumer of orchestration events.
///
/// Handlers MUST be idempotent: the outbox guarantees at-least-once
/// delivery, in per-item write order.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Handle one event.
    async fn handle(&self, event: &Event) -> Result<(), SubscriberError>;
}

/// Outbox delivery loop.
///
/// State-changing events are co-committed with their transition by the
/// store; this loop reads them back in insertion order, fans each one out to
/// every subscriber, and marks it delivered only when all subscribers
/// succeed. A stubbornly failing event stops the batch (preserving per-item
/// order) and is retried on the next poll.
pub struct EventBus {
    store: Arc<dyn WorkItemStore>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    poll_interval: Duration,
    metrics: Arc<OrchestratorMetrics>,
    shutdown: CancellationToken,
}

impl EventBus {
    /// Create a delivery loop over the given store and subscribers.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        poll_interval: Duration,
        metrics: Arc<OrchestratorMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            subscribers,
            poll_interval,
            metrics,
            shutdown,
        }
    }

    /// Run delivery polls until shutdown.
    pub async fn run(self) {
        info!(
            subscribers = self.subscribers.len(),
            "event delivery loop started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.deliver_pending().await {
                        warn!(error = %e, "event delivery poll failed");
                    }
                }
            }
        }
        info!("event delivery loop stopped");
    }

    /// Deliver everything currently undelivered, in order.
    pub(crate) async fn deliver_pending(&self) -> Result<(), StoreError> {
        loop {
            let events = self.store.undelivered_events(DELIVERY_BATCH).await?;
            if events.is_empty() {
                return Ok(());
            }

            for event in &events {
                if !self.deliver_one(event).await {
                    // Preserve order: stop here and retry from this event on
                    // the next poll.
                    return Ok(());
                }
                self.store.mark_delivered(&[event.id.clone()]).await?;
                self.metrics.incr(&self.metrics.events_delivered);
            }

            if events.len() < DELIVERY_BATCH {
                return Ok(());
            }
        }
    }

    /// Fan one event out to every subscriber, with bounded backoff per
    /// failing subscriber. Returns whether all subscribers succeeded.
    async fn deliver_one(&self, event: &Event) -> bool {
        for subscriber in &self.subscribers {
            let mut delivered = false;
            for attempt in 0..DELIVERY_ATTEMPTS {
                match subscriber.handle(event).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => {
                        self.metrics.incr(&self.metrics.event_delivery_retries);
                        warn!(
                            subscriber = subscriber.name(),
                            event_id = %event.id,
                            attempt,
                            error = %e,
                            "subscriber failed"
                        );
                        tokio::time::sleep(Duration::from_millis(
                            25 * u64::from(attempt + 1),
                        ))
                        .await;
                    }
                }
            }
            if !delivered {
                debug!(
                    subscriber = subscriber.name(),
                    event_id = %event.id,
                    "delivery deferred to next poll"
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use parking_lot::Mutex;

    use labelsquor_core::EventType;
    use labelsquor_store_memory::MemoryWorkItemStore;

    struct Recorder {
        seen: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &Event) -> Result<(), SubscriberError> {
            self.seen
                .lock()
                .push((event.work_item_id.clone(), event.seq));
            Ok(())
        }
    }

    struct FlakySubscriber {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EventSubscriber for FlakySubscriber {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _event: &Event) -> Result<(), SubscriberError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                Err(SubscriberError("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    fn bus_over(
        store: Arc<dyn WorkItemStore>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> EventBus {
        EventBus::new(
            store,
            subscribers,
            Duration::from_millis(10),
            Arc::new(OrchestratorMetrics::default()),
            CancellationToken::new(),
        )
    }

    async fn seed_events(store: &dyn WorkItemStore, item_id: &str, count: u64) {
        for i in 0..count {
            store
                .append_event(Event::new(
                    item_id,
                    EventType::StageStarted,
                    serde_json::json!({"i": i}),
                    Utc::now(),
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn delivers_in_seq_order_and_marks_delivered() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        seed_events(store.as_ref(), "wi-1", 5).await;

        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let bus = bus_over(store.clone(), vec![recorder.clone()]);
        bus.deliver_pending().await.unwrap();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1), "seq order");
        drop(seen);

        assert!(store.undelivered_events(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flaky_subscriber_is_retried() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        seed_events(store.as_ref(), "wi-1", 1).await;

        let flaky = Arc::new(FlakySubscriber {
            failures_left: AtomicU32::new(2),
        });
        let bus = bus_over(store.clone(), vec![flaky]);
        bus.deliver_pending().await.unwrap();

        assert!(
            store.undelivered_events(100).await.unwrap().is_empty(),
            "delivered within the retry budget"
        );
    }

    #[tokio::test]
    async fn stubborn_failure_blocks_later_events() {
        let store: Arc<dyn WorkItemStore> = Arc::new(MemoryWorkItemStore::new());
        seed_events(store.as_ref(), "wi-1", 3).await;

        let stubborn = Arc::new(FlakySubscriber {
            failures_left: AtomicU32::new(1_000),
        });
        let bus = bus_over(store.clone(), vec![stubborn.clone()]);
        bus.deliver_pending().await.unwrap();

        // Nothing was marked; order is preserved for the next poll.
        assert_eq!(store.undelivered_events(100).await.unwrap().len(), 3);

        // Once the subscriber recovers, the backlog drains in order.
        stubborn.failures_left.store(0, Ordering::SeqCst);
        bus.deliver_pending().await.unwrap();
        assert!(store.undelivered_events(100).await.unwrap().is_empty());
    }
}
