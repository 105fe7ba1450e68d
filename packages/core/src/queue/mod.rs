//! Message channel between the dispatcher and the notification consumer.
//!
//! [`NotificationChannel`] owns the producer/consumer topology: one durable
//! exchange, one durable queue, one binding. The broker itself sits behind
//! [`Connector`] / [`BrokerConnection`] so the same channel runs over AMQP
//! ([`amqp::AmqpConnector`]) or in-process ([`memory::MemoryBroker`]).

pub mod amqp;
pub mod codec;
pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::event::Event;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Buffer between a broker consumer and the worker pool.
pub const DELIVERY_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange kind: {}", other)),
        }
    }
}

/// Broker address and topology, used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub url: String,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A message pulled from the queue, not yet settled.
pub struct Delivery {
    body: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self { body, acker }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, QueueError>;
}

/// One live broker connection with a channel on it.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare a durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), QueueError>;

    /// Declare a durable queue.
    async fn declare_queue(&self, name: &str) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError>;

    /// Start consuming `queue`. Deliveries must be settled explicitly.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, QueueError>;

    /// Cancelled once the connection is lost or closed.
    fn closed(&self) -> CancellationToken;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Sink for due-event notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<(), QueueError>;
}

/// A consumption stream shared by the worker pool, plus the failure signal
/// of the connection it came from.
pub struct Subscription {
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    failure: CancellationToken,
}

impl Subscription {
    pub fn new(deliveries: mpsc::Receiver<Delivery>, failure: CancellationToken) -> Self {
        Self {
            deliveries: Mutex::new(deliveries),
            failure,
        }
    }

    /// Next delivery, or `None` once the stream has ended.
    pub async fn recv(&self) -> Option<Delivery> {
        self.deliveries.lock().await.recv().await
    }

    pub fn failure(&self) -> &CancellationToken {
        &self.failure
    }
}

/// Durable exchange + queue binding over a replaceable broker connection.
pub struct NotificationChannel {
    connector: Arc<dyn Connector>,
    config: QueueConfig,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
}

impl NotificationChannel {
    pub fn new(connector: Arc<dyn Connector>, config: QueueConfig) -> Self {
        Self {
            connector,
            config,
            connection: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Open a connection and declare the topology, replacing any previous
    /// connection.
    pub async fn connect(&self) -> Result<(), QueueError> {
        let connection = self.connector.connect(&self.config.url).await?;

        connection
            .declare_exchange(&self.config.exchange, self.config.exchange_kind)
            .await?;
        connection.declare_queue(&self.config.queue).await?;
        connection
            .bind_queue(&self.config.queue, &self.config.exchange, &self.config.routing_key)
            .await?;

        tracing::info!(
            exchange = %self.config.exchange,
            kind = %self.config.exchange_kind,
            queue = %self.config.queue,
            routing_key = %self.config.routing_key,
            "Message channel connected"
        );

        let previous = self.connection.write().await.replace(connection);
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                tracing::debug!(error = %err, "Closing replaced connection failed");
            }
        }
        Ok(())
    }

    async fn current(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotConnected)
    }

    /// Encode `event` and publish it to the exchange.
    pub async fn publish(&self, event: &Event) -> Result<(), QueueError> {
        let payload = codec::encode(event)?;
        let connection = self.current().await?;

        connection
            .publish(&self.config.exchange, &self.config.routing_key, payload)
            .await?;

        tracing::info!(
            event_id = %event.id,
            exchange = %self.config.exchange,
            "Notification published"
        );
        Ok(())
    }

    /// Start consuming the queue on the current connection.
    pub async fn subscribe(&self) -> Result<Subscription, QueueError> {
        let connection = self.current().await?;
        let deliveries = connection.consume(&self.config.queue).await?;
        Ok(Subscription::new(deliveries, connection.closed()))
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        let connection = self.connection.write().await.take();
        match connection {
            Some(connection) => {
                connection.close().await?;
                tracing::info!("Message channel closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Notifier for NotificationChannel {
    async fn notify(&self, event: &Event) -> Result<(), QueueError> {
        self.publish(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn config() -> QueueConfig {
        QueueConfig {
            url: "memory://".to_string(),
            exchange: "calendar".to_string(),
            exchange_kind: ExchangeKind::Direct,
            queue: "notifications".to_string(),
            routing_key: "notifications".to_string(),
        }
    }

    fn event() -> Event {
        let start = Utc.with_ymd_and_hms(2022, 4, 1, 10, 0, 0).unwrap();
        Event::new("Standup", 1, start, start).with_id("evt-1")
    }

    #[test]
    fn exchange_kind_parses_case_insensitively() {
        assert_eq!("Direct".parse::<ExchangeKind>().unwrap(), ExchangeKind::Direct);
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert_eq!("TOPIC".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
    }

    #[tokio::test]
    async fn publish_before_connect_is_not_connected() {
        let channel = NotificationChannel::new(Arc::new(MemoryBroker::new()), config());
        let err = channel.publish(&event()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
    }

    #[tokio::test]
    async fn connect_declares_topology() {
        let broker = MemoryBroker::new();
        let channel = NotificationChannel::new(Arc::new(broker.clone()), config());

        channel.connect().await.unwrap();

        assert_eq!(broker.exchange_kind("calendar"), Some(ExchangeKind::Direct));
        assert!(broker.has_queue("notifications"));
        assert!(broker.is_bound("notifications", "calendar", "notifications"));
    }

    #[tokio::test]
    async fn unreachable_broker_is_connection_error() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let channel = NotificationChannel::new(Arc::new(broker), config());

        let err = channel.connect().await.unwrap_err();

        assert!(matches!(err, QueueError::Connection(_)));
    }

    #[tokio::test]
    async fn published_event_reaches_subscriber() {
        let broker = MemoryBroker::new();
        let channel = NotificationChannel::new(Arc::new(broker.clone()), config());
        channel.connect().await.unwrap();
        let subscription = channel.subscribe().await.unwrap();

        channel.notify(&event()).await.unwrap();

        let delivery = subscription.recv().await.unwrap();
        let received = codec::decode(delivery.body()).unwrap();
        assert_eq!(received, event());
        delivery.ack().await.unwrap();
        assert_eq!(broker.acked(), 1);
    }

    #[tokio::test]
    async fn severed_connection_fires_failure_signal() {
        let broker = MemoryBroker::new();
        let channel = NotificationChannel::new(Arc::new(broker.clone()), config());
        channel.connect().await.unwrap();
        let subscription = channel.subscribe().await.unwrap();

        broker.sever();

        assert!(subscription.failure().is_cancelled());
        assert!(matches!(
            channel.publish(&event()).await,
            Err(QueueError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn close_then_publish_is_not_connected() {
        let channel = NotificationChannel::new(Arc::new(MemoryBroker::new()), config());
        channel.connect().await.unwrap();
        channel.close().await.unwrap();

        assert!(matches!(
            channel.publish(&event()).await,
            Err(QueueError::NotConnected)
        ));
    }
}
