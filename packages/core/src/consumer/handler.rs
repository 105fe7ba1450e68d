//! What a worker does with a decoded notification.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::event::{Event, EventId};

#[derive(Error, Debug)]
#[error("notification handler failed: {0}")]
pub struct HandlerError(pub String);

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Logs each notification and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl NotificationHandler for LogHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        tracing::info!(
            event_id = %event.id,
            user_id = event.user_id,
            title = %event.title,
            started_at = %event.started_at,
            "Event notification"
        );
        Ok(())
    }
}

/// Event ids remembered by [`IdempotentHandler`] unless told otherwise.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Runs the inner handler at most once per event id.
///
/// Delivery is at-least-once, so the same event can arrive more than once.
/// Deliveries of one id are serialized: a duplicate that arrives while the
/// first run is in flight waits for it, and runs itself if that run failed.
/// Only the most recent `capacity` ids are remembered.
pub struct IdempotentHandler<H> {
    inner: H,
    capacity: usize,
    slots: Mutex<Slots>,
    handled: AtomicUsize,
}

#[derive(Default)]
struct Slots {
    by_id: HashMap<EventId, Arc<AsyncMutex<bool>>>,
    order: VecDeque<EventId>,
}

impl<H> IdempotentHandler<H> {
    pub fn new(inner: H) -> Self {
        Self::with_capacity(inner, DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_capacity(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            slots: Mutex::new(Slots::default()),
            handled: AtomicUsize::new(0),
        }
    }

    /// Successful runs of the inner handler.
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    /// Ids currently remembered.
    pub fn remembered(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    /// The slot for `id`, evicting the oldest ids past capacity.
    fn slot(&self, id: &EventId) -> Arc<AsyncMutex<bool>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.by_id.get(id) {
            return Arc::clone(slot);
        }

        while slots.order.len() >= self.capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.by_id.remove(&oldest);
                }
                None => break,
            }
        }

        let slot = Arc::new(AsyncMutex::new(false));
        slots.by_id.insert(id.clone(), Arc::clone(&slot));
        slots.order.push_back(id.clone());
        slot
    }
}

#[async_trait]
impl<H: NotificationHandler> NotificationHandler for IdempotentHandler<H> {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let slot = self.slot(&event.id);
        let mut done = slot.lock().await;
        if *done {
            tracing::debug!(event_id = %event.id, "Duplicate notification skipped");
            return Ok(());
        }

        self.inner.handle(event).await?;
        *done = true;
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
