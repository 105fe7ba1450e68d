//! Catalog service.
//!
//! The only mutator of stored events. Every operation validates its input,
//! checks for scheduling conflicts where relevant, and runs its store calls
//! as a supervised tokio task raced against the caller's
//! [`CancellationToken`]. When the token wins, the task is aborted and the
//! caller gets [`CatalogError::Cancelled`] straight away.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventId};
use crate::storage::{EventStore, Period, StorageError};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("required field is missing or empty: {field}")]
    InvalidField { field: &'static str },

    #[error("finished_at {finished_at} is before started_at {started_at}")]
    InvalidDate {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },

    #[error("date is busy: conflicts with event {existing}")]
    DateBusy { existing: EventId },

    #[error(transparent)]
    Store(#[from] StorageError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation task aborted: {0}")]
    Aborted(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::Store(StorageError::NotFound(_)))
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Validated, cancellable access to an [`EventStore`].
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn EventStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Validate and store a new event, returning its assigned id.
    ///
    /// Any client-supplied id is discarded and `sent` starts out `false`.
    pub async fn create_event(
        &self,
        cancel: &CancellationToken,
        event: Event,
    ) -> CatalogResult<EventId> {
        validate(&event)?;
        let event = Event {
            id: EventId::default(),
            sent: false,
            ..event
        };

        self.run(cancel, "create_event", move |store| async move {
            ensure_free(store.as_ref(), &event).await?;
            let id = store.insert(event).await?;
            tracing::debug!(event_id = %id, "Event created");
            Ok(id)
        })
        .await
    }

    /// Validate and replace a stored event. The event may keep its own slot.
    pub async fn update_event(
        &self,
        cancel: &CancellationToken,
        event: Event,
    ) -> CatalogResult<Event> {
        validate(&event)?;

        self.run(cancel, "update_event", move |store| async move {
            ensure_free(store.as_ref(), &event).await?;
            let updated = store.update(event).await?;
            tracing::debug!(event_id = %updated.id, "Event updated");
            Ok(updated)
        })
        .await
    }

    pub async fn find_by_id(
        &self,
        cancel: &CancellationToken,
        id: &EventId,
    ) -> CatalogResult<Event> {
        let id = id.clone();
        self.run(cancel, "find_by_id", move |store| async move {
            Ok(store.find_by_id(&id).await?)
        })
        .await
    }

    /// Delete an event and return what was stored.
    pub async fn delete_by_id(
        &self,
        cancel: &CancellationToken,
        id: &EventId,
    ) -> CatalogResult<Event> {
        let id = id.clone();
        self.run(cancel, "delete_by_id", move |store| async move {
            let event = store.find_by_id(&id).await?;
            store.delete_event(&event).await?;
            tracing::debug!(event_id = %id, "Event deleted");
            Ok(event)
        })
        .await
    }

    pub async fn find_by_interval(
        &self,
        cancel: &CancellationToken,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CatalogResult<Vec<Event>> {
        self.run(cancel, "find_by_interval", move |store| async move {
            Ok(store.select_interval(start, end).await?)
        })
        .await
    }

    pub async fn find_period(
        &self,
        cancel: &CancellationToken,
        period: Period,
        date: DateTime<FixedOffset>,
    ) -> CatalogResult<Vec<Event>> {
        self.run(cancel, "find_period", move |store| async move {
            Ok(store.select_period(period, date).await?)
        })
        .await
    }

    pub async fn find_day(
        &self,
        cancel: &CancellationToken,
        date: DateTime<FixedOffset>,
    ) -> CatalogResult<Vec<Event>> {
        self.find_period(cancel, Period::Day, date).await
    }

    pub async fn find_week(
        &self,
        cancel: &CancellationToken,
        date: DateTime<FixedOffset>,
    ) -> CatalogResult<Vec<Event>> {
        self.find_period(cancel, Period::Week, date).await
    }

    pub async fn find_month(
        &self,
        cancel: &CancellationToken,
        date: DateTime<FixedOffset>,
    ) -> CatalogResult<Vec<Event>> {
        self.find_period(cancel, Period::Month, date).await
    }

    /// Unsent events whose notification time has passed.
    pub async fn find_to_send(&self, cancel: &CancellationToken) -> CatalogResult<Vec<Event>> {
        self.run(cancel, "find_to_send", move |store| async move {
            Ok(store.select_to_notify().await?)
        })
        .await
    }

    pub async fn mark_as_sent(
        &self,
        cancel: &CancellationToken,
        id: &EventId,
    ) -> CatalogResult<()> {
        let id = id.clone();
        self.run(cancel, "mark_as_sent", move |store| async move {
            store.mark_sent(&id).await?;
            tracing::debug!(event_id = %id, "Event marked as sent");
            Ok(())
        })
        .await
    }

    /// Prune events past the retention window, returning how many were removed.
    pub async fn delete_old_events(&self, cancel: &CancellationToken) -> CatalogResult<u64> {
        self.run(cancel, "delete_old_events", move |store| async move {
            let deleted = store.delete_old_events().await?;
            if deleted > 0 {
                tracing::debug!(count = deleted, "Old events deleted");
            }
            Ok(deleted)
        })
        .await
    }

    /// Spawn `work` and race it against `cancel`. A cancelled task is aborted
    /// at its next suspension point.
    async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        work: F,
    ) -> CatalogResult<T>
    where
        F: FnOnce(Arc<dyn EventStore>) -> Fut,
        Fut: Future<Output = CatalogResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CatalogError::Cancelled);
        }

        let mut task = tokio::spawn(work(Arc::clone(&self.store)));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                task.abort();
                tracing::debug!(op, "Catalog operation cancelled");
                Err(CatalogError::Cancelled)
            }

            joined = &mut task => {
                joined.map_err(|err| CatalogError::Aborted(err.to_string()))?
            }
        }
    }
}

fn validate(event: &Event) -> CatalogResult<()> {
    if event.title.is_empty() {
        return Err(CatalogError::InvalidField { field: "title" });
    }
    if event.user_id == 0 {
        return Err(CatalogError::InvalidField { field: "userId" });
    }
    if event.finished_at < event.started_at {
        return Err(CatalogError::InvalidDate {
            started_at: event.started_at,
            finished_at: event.finished_at,
        });
    }
    Ok(())
}

/// Fail with `DateBusy` when another event starts inside `event`'s interval.
///
/// Not atomic with the following write: two concurrent callers can both
/// pass this check.
async fn ensure_free(store: &dyn EventStore, event: &Event) -> CatalogResult<()> {
    let busy = store
        .select_interval(event.started_at, event.finished_at)
        .await?;

    match busy.into_iter().find(|other| other.id != event.id) {
        Some(other) => Err(CatalogError::DateBusy { existing: other.id }),
        None => Ok(()),
    }
}
