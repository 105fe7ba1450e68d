//! Relational event store.
//!
//! All SQL for events lives here. Timestamps and the notify interval are
//! stored as integer microseconds so interval and due-time comparisons are
//! evaluated by the database. Concurrency control is left to the pool and
//! SQLite's own locking; no operation spans more than one statement.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::Row;

use crate::db::{self, DbConfig};
use crate::event::{Event, EventId};
use crate::storage::{padded, EventStore, StorageError, StorageResult};

const INSERT_EVENT: &str = "INSERT INTO events
     (id, title, description, user_id, started_at, finished_at, notify_interval, sent)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_EVENT: &str = "UPDATE events
     SET title = ?, description = ?, user_id = ?, started_at = ?, finished_at = ?,
         notify_interval = ?, sent = (sent OR ?)
     WHERE id = ?";

const SELECT_BY_ID: &str = "SELECT id, title, description, user_id, started_at, finished_at,
            notify_interval, sent
     FROM events WHERE id = ?";

const SELECT_ALL: &str = "SELECT id, title, description, user_id, started_at, finished_at,
            notify_interval, sent
     FROM events";

const SELECT_INTERVAL: &str = "SELECT id, title, description, user_id, started_at, finished_at,
            notify_interval, sent
     FROM events
     WHERE started_at > ? AND started_at < ?
     ORDER BY started_at ASC";

const SELECT_TO_NOTIFY: &str = "SELECT id, title, description, user_id, started_at, finished_at,
            notify_interval, sent
     FROM events
     WHERE sent = 0 AND started_at - notify_interval <= ?
     ORDER BY started_at ASC";

const DELETE_BY_ID: &str = "DELETE FROM events WHERE id = ?";

const MARK_SENT: &str = "UPDATE events SET sent = 1 WHERE id = ?";

const DELETE_FINISHED_BEFORE: &str = "DELETE FROM events WHERE finished_at < ?";

/// Event store backed by an SQLite pool.
#[derive(Debug, Clone)]
pub struct SqlEventStore {
    pool: SqlitePool,
}

impl SqlEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool from `config`.
    pub async fn connect(config: &DbConfig) -> StorageResult<Self> {
        let pool = db::create_pool(config).await?;
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool opened"
        );
        Ok(Self::new(pool))
    }

    /// Bring the schema up to date.
    pub async fn migrate(&self, source: Option<&Path>) -> StorageResult<()> {
        db::run_migrations(&self.pool, source).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Close every pooled connection. Pending queries finish first.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database pool closed");
    }

    async fn fetch_events<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> StorageResult<Vec<Event>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl EventStore for SqlEventStore {
    async fn insert(&self, mut event: Event) -> StorageResult<EventId> {
        if !event.id.is_assigned() {
            event.id = EventId::generate();
        }

        let result = sqlx::query(INSERT_EVENT)
            .bind(event.id.as_str())
            .bind(&event.title)
            .bind(event.description.as_deref())
            .bind(event.user_id)
            .bind(event.started_at.timestamp_micros())
            .bind(event.finished_at.timestamp_micros())
            .bind(duration_micros(event.notify_interval))
            .bind(event.sent)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(event.id),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StorageError::AlreadyExists(event.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, event: Event) -> StorageResult<Event> {
        let result = sqlx::query(UPDATE_EVENT)
            .bind(&event.title)
            .bind(event.description.as_deref())
            .bind(event.user_id)
            .bind(event.started_at.timestamp_micros())
            .bind(event.finished_at.timestamp_micros())
            .bind(duration_micros(event.notify_interval))
            .bind(event.sent)
            .bind(event.id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(event.id));
        }
        self.find_by_id(&event.id).await
    }

    async fn find_by_id(&self, id: &EventId) -> StorageResult<Event> {
        let row = sqlx::query(SELECT_BY_ID)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        event_from_row(&row)
    }

    async fn delete_by_id(&self, id: &EventId) -> StorageResult<()> {
        let result = sqlx::query(DELETE_BY_ID)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn select_all(&self) -> StorageResult<Vec<Event>> {
        self.fetch_events(sqlx::query(SELECT_ALL)).await
    }

    async fn select_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>> {
        let (begin, end) = padded(start, end);
        let query = sqlx::query(SELECT_INTERVAL)
            .bind(begin.timestamp_micros())
            .bind(end.timestamp_micros());
        self.fetch_events(query).await
    }

    async fn select_to_notify_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<Event>> {
        let query = sqlx::query(SELECT_TO_NOTIFY).bind(now.timestamp_micros());
        self.fetch_events(query).await
    }

    async fn mark_sent(&self, id: &EventId) -> StorageResult<()> {
        let result = sqlx::query(MARK_SENT)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(DELETE_FINISHED_BEFORE)
            .bind(cutoff.timestamp_micros())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn duration_micros(interval: Duration) -> i64 {
    i64::try_from(interval.as_micros()).unwrap_or(i64::MAX)
}

fn timestamp(id: &str, column: &str, micros: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StorageError::Corrupt {
        id: id.to_string(),
        message: format!("{column} out of range: {micros}"),
    })
}

fn event_from_row(row: &SqliteRow) -> StorageResult<Event> {
    let id: String = row.try_get("id")?;
    let started_at = timestamp(&id, "started_at", row.try_get("started_at")?)?;
    let finished_at = timestamp(&id, "finished_at", row.try_get("finished_at")?)?;
    let notify_micros: i64 = row.try_get("notify_interval")?;

    Ok(Event {
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        user_id: row.try_get("user_id")?,
        started_at,
        finished_at,
        notify_interval: Duration::from_micros(u64::try_from(notify_micros).unwrap_or(0)),
        sent: row.try_get("sent")?,
        id: EventId::from(id),
    })
}
