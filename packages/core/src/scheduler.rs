//! Notification dispatcher.
//!
//! Drives the timer loop: each tick prunes expired events, fetches events
//! whose notification is due, publishes each one and marks it sent, so
//! consumers hear about every event at least once.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, CatalogError};
use crate::event::EventId;
use crate::queue::{Notifier, QueueError};

/// Any error ends the dispatcher. Restarting is safe: unsent events are
/// picked up again on the next run.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("pruning old events failed: {0}")]
    Prune(#[source] CatalogError),

    #[error("fetching due events failed: {0}")]
    Fetch(#[source] CatalogError),

    #[error("publishing event {id} failed: {source}")]
    Publish {
        id: EventId,
        #[source]
        source: QueueError,
    },

    #[error("marking event {id} as sent failed: {source}")]
    MarkSent {
        id: EventId,
        #[source]
        source: CatalogError,
    },
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub pruned: u64,
    pub published: usize,
}

/// Run the dispatch loop.
///
/// On each tick:
/// 1. Delete events past the retention window
/// 2. Fetch due, unsent events
/// 3. Publish each one through `notifier`, then mark it sent
///
/// The first tick fires one `period` after start. Returns `Ok(())` once
/// `shutdown` fires between ticks; a tick in progress is never interrupted.
/// Any tick error is returned immediately.
pub async fn run_dispatcher(
    catalog: Arc<Catalog>,
    notifier: Arc<dyn Notifier>,
    period: Duration,
    shutdown: CancellationToken,
) -> Result<(), DispatchError> {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_ms = period.as_millis() as u64, "Dispatcher started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown signal received. Stopping dispatcher.");
                break;
            }

            _ = ticker.tick() => {
                dispatch_once(&catalog, notifier.as_ref()).await?;
            }
        }
    }

    tracing::info!("Dispatcher stopped cleanly");
    Ok(())
}

/// Execute a single tick. Extracted for testability.
pub async fn dispatch_once(
    catalog: &Catalog,
    notifier: &dyn Notifier,
) -> Result<TickSummary, DispatchError> {
    // A tick runs to completion; only the loop observes shutdown.
    let tick = CancellationToken::new();

    let pruned = catalog
        .delete_old_events(&tick)
        .await
        .map_err(DispatchError::Prune)?;

    let due = catalog
        .find_to_send(&tick)
        .await
        .map_err(DispatchError::Fetch)?;

    let mut published = 0;
    for event in &due {
        notifier
            .notify(event)
            .await
            .map_err(|source| DispatchError::Publish {
                id: event.id.clone(),
                source,
            })?;

        catalog
            .mark_as_sent(&tick, &event.id)
            .await
            .map_err(|source| DispatchError::MarkSent {
                id: event.id.clone(),
                source,
            })?;
        published += 1;
    }

    if published > 0 || pruned > 0 {
        tracing::info!(published, pruned, "Dispatch tick complete");
    } else {
        tracing::debug!("Dispatch tick: nothing due");
    }

    Ok(TickSummary { pruned, published })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::event::Event;
    use crate::storage::{EventStore, MemoryEventStore};

    // ---- mock notifiers ----

    #[derive(Default)]
    struct RecordingNotifier {
        published: Mutex<Vec<EventId>>,
    }

    impl RecordingNotifier {
        fn ids(&self) -> Vec<EventId> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &Event) -> Result<(), QueueError> {
            self.published.lock().unwrap().push(event.id.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: &Event) -> Result<(), QueueError> {
            Err(QueueError::Connection("broker gone".to_string()))
        }
    }

    /// Deletes the event from the store while "publishing" it, so the
    /// following mark-as-sent fails.
    struct VanishingNotifier {
        store: Arc<MemoryEventStore>,
    }

    #[async_trait]
    impl Notifier for VanishingNotifier {
        async fn notify(&self, event: &Event) -> Result<(), QueueError> {
            self.store
                .delete_by_id(&event.id)
                .await
                .map_err(|err| QueueError::Protocol(err.to_string()))
        }
    }

    fn setup() -> (Arc<Catalog>, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        (Arc::new(Catalog::new(store.clone())), store)
    }

    async fn seed_due(catalog: &Catalog, offset_secs: i64) -> EventId {
        let start = Utc::now() + ChronoDuration::seconds(offset_secs);
        let event = Event::new("Due", 1, start, start + ChronoDuration::minutes(5))
            .with_notify_interval(Duration::from_secs(15));
        catalog.create_event(&CancellationToken::new(), event).await.unwrap()
    }

    // ---- dispatch_once ----

    #[tokio::test]
    async fn due_event_is_published_once_and_marked_sent() {
        let (catalog, store) = setup();
        let id = seed_due(&catalog, 10).await;
        let notifier = RecordingNotifier::default();

        let first = dispatch_once(&catalog, &notifier).await.unwrap();
        let second = dispatch_once(&catalog, &notifier).await.unwrap();

        assert_eq!(first.published, 1);
        assert_eq!(second.published, 0);
        assert_eq!(notifier.ids(), vec![id.clone()]);
        assert!(store.find_by_id(&id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn events_not_yet_due_are_left_alone() {
        let (catalog, store) = setup();
        let start = Utc::now() + ChronoDuration::hours(2);
        let event = Event::new("Later", 1, start, start)
            .with_notify_interval(Duration::from_secs(60));
        let id = catalog.create_event(&CancellationToken::new(), event).await.unwrap();
        let notifier = RecordingNotifier::default();

        let summary = dispatch_once(&catalog, &notifier).await.unwrap();

        assert_eq!(summary, TickSummary::default());
        assert!(!store.find_by_id(&id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn due_events_are_published_in_start_order() {
        let (catalog, _) = setup();
        let cancel = CancellationToken::new();
        let soon = Utc::now() + ChronoDuration::minutes(1);
        let later = soon + ChronoDuration::minutes(10);
        let hour = Duration::from_secs(3600);

        let second = catalog
            .create_event(&cancel, Event::new("Second", 1, later, later).with_notify_interval(hour))
            .await
            .unwrap();
        let first = catalog
            .create_event(&cancel, Event::new("First", 1, soon, soon).with_notify_interval(hour))
            .await
            .unwrap();
        let notifier = RecordingNotifier::default();

        dispatch_once(&catalog, &notifier).await.unwrap();

        assert_eq!(notifier.ids(), vec![first, second]);
    }

    #[tokio::test]
    async fn tick_prunes_expired_events() {
        let (catalog, store) = setup();
        let now = Utc::now();
        store
            .insert(Event::new(
                "Expired",
                1,
                now - ChronoDuration::days(401),
                now - ChronoDuration::days(400),
            ))
            .await
            .unwrap();

        let summary = dispatch_once(&catalog, &RecordingNotifier::default()).await.unwrap();

        assert_eq!(summary.pruned, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn publish_failure_leaves_event_unsent() {
        let (catalog, store) = setup();
        let id = seed_due(&catalog, 10).await;

        let err = dispatch_once(&catalog, &FailingNotifier).await.unwrap_err();

        assert!(matches!(err, DispatchError::Publish { id: failed, .. } if failed == id));
        assert!(!store.find_by_id(&id).await.unwrap().sent);
    }

    #[tokio::test]
    async fn mark_sent_failure_is_fatal() {
        let (catalog, store) = setup();
        let id = seed_due(&catalog, 10).await;
        let notifier = VanishingNotifier { store };

        let err = dispatch_once(&catalog, &notifier).await.unwrap_err();

        assert!(matches!(err, DispatchError::MarkSent { id: failed, .. } if failed == id));
    }

    // ---- run_dispatcher ----

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let (catalog, _) = setup();
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let result = run_dispatcher(
            catalog,
            Arc::new(RecordingNotifier::default()),
            Duration::from_secs(3),
            shutdown,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_dispatches_on_tick() {
        let (catalog, store) = setup();
        let id = seed_due(&catalog, 10).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(4)).await;
            trigger.cancel();
        });

        run_dispatcher(catalog, notifier.clone(), Duration::from_secs(3), shutdown)
            .await
            .unwrap();

        assert_eq!(notifier.ids(), vec![id.clone()]);
        assert!(store.find_by_id(&id).await.unwrap().sent);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_with_error_on_failed_tick() {
        let (catalog, _) = setup();
        seed_due(&catalog, 10).await;

        let result = run_dispatcher(
            catalog,
            Arc::new(FailingNotifier),
            Duration::from_secs(3),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(DispatchError::Publish { .. })));
    }
}
