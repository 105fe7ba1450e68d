//! Event persistence.
//!
//! [`EventStore`] is the capability set both backends implement:
//! [`memory::MemoryEventStore`] for single-process deployments and tests,
//! [`sql::SqlEventStore`] for the relational database. The backend is
//! chosen once at startup and shared as `Arc<dyn EventStore>`.

pub mod memory;
pub mod period;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use thiserror::Error;

use crate::event::{Event, EventId};

pub use memory::MemoryEventStore;
pub use period::Period;
pub use sql::SqlEventStore;

/// Events whose `finished_at` is older than this are pruned.
pub const RETENTION_DAYS: i64 = 365;

/// Padding applied to both ends of an interval query to absorb the
/// truncation of stored timestamps.
pub const INTERVAL_PAD_SECS: i64 = 1;

/// Errors returned by [`EventStore`] implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("event not found: id = {0}")]
    NotFound(EventId),

    #[error("event is already inserted: id = {0}")]
    AlreadyExists(EventId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row for event {id}: {message}")]
    Corrupt { id: String, message: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage capability set shared by every backend.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event, assigning an id when it has none.
    async fn insert(&self, event: Event) -> StorageResult<EventId>;

    /// Replace a stored event. `sent` is never cleared by an update.
    async fn update(&self, event: Event) -> StorageResult<Event>;

    async fn find_by_id(&self, id: &EventId) -> StorageResult<Event>;

    async fn delete_by_id(&self, id: &EventId) -> StorageResult<()>;

    async fn delete_event(&self, event: &Event) -> StorageResult<()> {
        self.delete_by_id(&event.id).await
    }

    async fn select_all(&self) -> StorageResult<Vec<Event>>;

    /// Events with `start - 1s < started_at < end + 1s`, ascending by `started_at`.
    async fn select_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>>;

    /// Events inside the calendar period containing `date`, computed in
    /// `date`'s own offset.
    async fn select_period(
        &self,
        period: Period,
        date: DateTime<FixedOffset>,
    ) -> StorageResult<Vec<Event>> {
        let (start, end) = period.bounds(&date);
        self.select_interval(start, end).await
    }

    async fn select_day(&self, date: DateTime<FixedOffset>) -> StorageResult<Vec<Event>> {
        self.select_period(Period::Day, date).await
    }

    async fn select_week(&self, date: DateTime<FixedOffset>) -> StorageResult<Vec<Event>> {
        self.select_period(Period::Week, date).await
    }

    async fn select_month(&self, date: DateTime<FixedOffset>) -> StorageResult<Vec<Event>> {
        self.select_period(Period::Month, date).await
    }

    /// Unsent events whose notification time is at or before `now`,
    /// ascending by `started_at`.
    async fn select_to_notify_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<Event>>;

    async fn select_to_notify(&self) -> StorageResult<Vec<Event>> {
        self.select_to_notify_at(Utc::now()).await
    }

    /// Set `sent = true`. Calling it again on the same id is not an error.
    async fn mark_sent(&self, id: &EventId) -> StorageResult<()>;

    /// Delete events that finished before `cutoff`, returning how many were removed.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    async fn delete_old_events(&self) -> StorageResult<u64> {
        self.delete_finished_before(retention_cutoff(Utc::now())).await
    }
}

/// Oldest `finished_at` still retained at `now`.
pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(RETENTION_DAYS)
}

/// Open interval bounds used by `select_interval`.
pub(crate) fn padded(start: DateTime<Utc>, end: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let pad = Duration::seconds(INTERVAL_PAD_SECS);
    (start - pad, end + pad)
}
