//! In-memory event store.
//!
//! `MemoryEventStore` keeps every event in a `HashMap` keyed by id behind a
//! single `tokio::sync::RwLock`: queries share the read lock, mutations take
//! the write lock, so every write is visible to all later reads.
//!
//! Query results are cloned snapshots; nothing returned here aliases the map.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::event::{Event, EventId};
use crate::storage::{padded, EventStore, StorageError, StorageResult};

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<EventId, Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// `true` when the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    async fn select_where<F>(&self, predicate: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut selected: Vec<Event> = {
            let events = self.events.read().await;
            events.values().filter(|e| predicate(*e)).cloned().collect()
        };
        selected.sort_by_key(|e| e.started_at);
        selected
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, mut event: Event) -> StorageResult<EventId> {
        let mut events = self.events.write().await;

        if !event.id.is_assigned() {
            event.id = EventId::generate();
        }
        if events.contains_key(&event.id) {
            return Err(StorageError::AlreadyExists(event.id));
        }

        let id = event.id.clone();
        events.insert(id.clone(), event);
        Ok(id)
    }

    async fn update(&self, mut event: Event) -> StorageResult<Event> {
        let mut events = self.events.write().await;

        let stored = events
            .get_mut(&event.id)
            .ok_or_else(|| StorageError::NotFound(event.id.clone()))?;
        event.sent |= stored.sent;
        *stored = event.clone();

        Ok(event)
    }

    async fn find_by_id(&self, id: &EventId) -> StorageResult<Event> {
        self.events
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn delete_by_id(&self, id: &EventId) -> StorageResult<()> {
        self.events
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn select_all(&self) -> StorageResult<Vec<Event>> {
        Ok(self.events.read().await.values().cloned().collect())
    }

    async fn select_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>> {
        let (begin, end) = padded(start, end);
        Ok(self
            .select_where(|e| e.started_at > begin && e.started_at < end)
            .await)
    }

    async fn select_to_notify_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<Event>> {
        Ok(self.select_where(|e| e.is_due(now)).await)
    }

    async fn mark_sent(&self, id: &EventId) -> StorageResult<()> {
        let mut events = self.events.write().await;
        let stored = events
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;
        stored.sent = true;
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, e| e.finished_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
