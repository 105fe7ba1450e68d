//! Notification consumer.
//!
//! A fixed pool of workers drains the channel's delivery stream. When the
//! broker connection drops, the pool is torn down and the consumer walks
//! the reconnect state machine:
//!
//! ```text
//! Connected -> Disconnected -> Reconnecting -> Connected
//!                                           \-> Failed
//! ```
//!
//! Reconnect attempts are spaced by [`backoff::ExponentialBackoff`] and stop
//! once its elapsed-time budget is spent.

pub mod backoff;
pub mod handler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::queue::{codec, Delivery, NotificationChannel, QueueError, Subscription};

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use handler::{HandlerError, IdempotentHandler, LogHandler, NotificationHandler};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("gave up reconnecting after {attempts} attempts in {elapsed:?}")]
    ReconnectExhausted { attempts: u32, elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Connected => "connected",
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a worker pool stopped.
#[derive(Debug, PartialEq, Eq)]
enum Drained {
    Shutdown,
    ConnectionLost,
}

pub struct NotificationConsumer {
    channel: Arc<NotificationChannel>,
    handler: Arc<dyn NotificationHandler>,
    workers: usize,
    backoff: BackoffConfig,
    state: watch::Sender<ConsumerState>,
}

impl NotificationConsumer {
    pub fn new(channel: Arc<NotificationChannel>, handler: Arc<dyn NotificationHandler>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            channel,
            handler,
            workers: 1,
            backoff: BackoffConfig::default(),
            state,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` fires or reconnecting fails.
    ///
    /// Returns `Ok(())` on shutdown, including shutdown during a backoff
    /// wait, and [`ConsumerError::ReconnectExhausted`] once the backoff
    /// budget runs out. The channel does not need to be connected up front.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<(), ConsumerError> {
        let mut subscription = match self.channel.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(error = %err, "Message channel unavailable");
                self.transition(ConsumerState::Disconnected);
                match self.reconnect(shutdown).await? {
                    Some(subscription) => subscription,
                    None => return Ok(()),
                }
            }
        };

        loop {
            self.transition(ConsumerState::Connected);

            if self.drain(subscription, shutdown).await == Drained::Shutdown {
                if let Err(err) = self.channel.close().await {
                    tracing::warn!(error = %err, "Closing message channel failed");
                }
                tracing::info!("Notification consumer stopped cleanly");
                return Ok(());
            }

            tracing::warn!("Broker connection lost");
            self.transition(ConsumerState::Disconnected);

            subscription = match self.reconnect(shutdown).await? {
                Some(subscription) => subscription,
                None => return Ok(()),
            };
        }
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Consumer state changed");
        }
    }

    /// Retry connecting until it works, the budget is spent, or shutdown.
    /// `Ok(None)` means shutdown.
    async fn reconnect(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Subscription>, ConsumerError> {
        self.transition(ConsumerState::Reconnecting);
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());
        let mut attempts = 0u32;

        loop {
            let Some(delay) = backoff.next_delay() else {
                self.transition(ConsumerState::Failed);
                tracing::error!(attempts, "Reconnect budget exhausted");
                return Err(ConsumerError::ReconnectExhausted {
                    attempts,
                    elapsed: backoff.elapsed(),
                });
            };

            attempts += 1;
            tracing::info!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to broker"
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received during reconnect");
                    return Ok(None);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // An attempt may not outlive the budget; a hung connect counts
            // as a failed attempt.
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received during reconnect");
                    return Ok(None);
                }
                attempt = timeout(backoff.remaining(), self.resubscribe()) => attempt,
            };

            match attempt {
                Ok(Ok(subscription)) => {
                    tracing::info!(attempt = attempts, "Reconnected to broker");
                    return Ok(Some(subscription));
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt = attempts, error = %err, "Reconnect attempt failed");
                }
                Err(_) => {
                    tracing::warn!(attempt = attempts, "Reconnect attempt timed out");
                }
            }
        }
    }

    async fn resubscribe(&self) -> Result<Subscription, QueueError> {
        self.channel.connect().await?;
        self.channel.subscribe().await
    }

    /// Run the worker pool against one subscription until every worker exits.
    async fn drain(&self, subscription: Subscription, shutdown: &CancellationToken) -> Drained {
        let subscription = Arc::new(subscription);
        let mut workers = JoinSet::new();

        for worker in 0..self.workers {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&subscription),
                Arc::clone(&self.handler),
                shutdown.clone(),
            ));
        }
        tracing::info!(workers = self.workers, "Notification consumer connected");

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Consumer worker panicked");
            }
        }

        if shutdown.is_cancelled() {
            Drained::Shutdown
        } else {
            Drained::ConnectionLost
        }
    }
}

async fn run_worker(
    worker: usize,
    subscription: Arc<Subscription>,
    handler: Arc<dyn NotificationHandler>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker, "Worker started");

    loop {
        let delivery = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = subscription.failure().cancelled() => break,
            next = subscription.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    // Stream ended under us: treat as connection loss.
                    subscription.failure().cancel();
                    break;
                }
            },
        };

        process(worker, delivery, handler.as_ref()).await;
    }

    tracing::debug!(worker, "Worker stopped");
}

/// Decode, hand to the handler, and settle one delivery. Undecodable and
/// unhandled messages are rejected without requeue.
async fn process(worker: usize, delivery: Delivery, handler: &dyn NotificationHandler) {
    let event = match codec::decode(delivery.body()) {
        Ok(event) => event,
        Err(err) => {
            tracing::error!(worker, error = %err, "Dropping malformed message");
            if let Err(err) = delivery.reject(false).await {
                tracing::warn!(worker, error = %err, "Reject failed");
            }
            return;
        }
    };

    tracing::info!(worker, event_id = %event.id, title = %event.title, "Notification received");

    let settled = match handler.handle(&event).await {
        Ok(()) => delivery.ack().await,
        Err(err) => {
            tracing::error!(
                worker,
                event_id = %event.id,
                error = %err,
                "Notification handling failed"
            );
            delivery.reject(false).await
        }
    };
    if let Err(err) = settled {
        tracing::warn!(worker, event_id = %event.id, error = %err, "Settling delivery failed");
    }
}
