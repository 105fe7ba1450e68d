//! AMQP 0-9-1 broker backend built on `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::{
    codec, Acknowledge, BrokerConnection, Connector, Delivery, ExchangeKind, QueueError,
    DELIVERY_BUFFER,
};

const CONSUMER_TAG: &str = "calendar-sender";

/// Opens connections to an AMQP broker such as RabbitMQ.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

fn protocol(err: lapin::Error) -> QueueError {
    QueueError::Protocol(err.to_string())
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))?;
        let channel = connection.create_channel().await.map_err(protocol)?;

        let closed = CancellationToken::new();
        let signal = closed.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "AMQP connection error");
            signal.cancel();
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            channel,
            closed,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), QueueError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(protocol)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        let properties = BasicProperties::default().with_content_type(codec::CONTENT_TYPE.into());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(protocol)?
            .await
            .map_err(protocol)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, QueueError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let closed = self.closed.clone();

        // Forward the lapin stream until it ends or the pool goes away.
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let acker = AmqpAcker(delivery.acker);
                        if sender
                            .send(Delivery::new(delivery.data, Box::new(acker)))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "AMQP consumer stream failed");
                        closed.cancel();
                        break;
                    }
                }
            }
        });

        Ok(receiver)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        self.connection.close(200, "Bye").await.map_err(protocol)
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(protocol)
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kinds_map_to_amqp() {
        assert_eq!(exchange_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeKind::Fanout), lapin::ExchangeKind::Fanout);
        assert_eq!(exchange_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic);
        assert_eq!(exchange_kind(ExchangeKind::Headers), lapin::ExchangeKind::Headers);
    }

    #[tokio::test]
    async fn unreachable_url_is_connection_error() {
        let result = AmqpConnector::new().connect("amqp://127.0.0.1:1/%2f").await;
        assert!(matches!(result, Err(QueueError::Connection(_))));
    }
}
