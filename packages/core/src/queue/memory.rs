//! In-process broker.
//!
//! Implements the same [`Connector`] / [`BrokerConnection`] contract as the
//! AMQP backend, with durable queues that hold messages until a consumer
//! shows up. Reachability and connection loss are controllable so reconnect
//! behaviour can be exercised without a real broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;
use crate::queue::{
    codec, Acknowledge, BrokerConnection, Connector, Delivery, ExchangeKind, QueueError,
    DELIVERY_BUFFER,
};

/// Shared handle to an in-process broker. Clones see the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    reachable: AtomicBool,
    connect_attempts: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    topology: Mutex<Topology>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<Vec<u8>>,
    connections: Vec<CancellationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Vec<u8>>,
    consumers: Vec<QueueConsumer>,
    next: usize,
}

struct QueueConsumer {
    connection: CancellationToken,
    sender: mpsc::Sender<Delivery>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                reachable: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                acked: AtomicUsize::new(0),
                rejected: AtomicUsize::new(0),
                topology: Mutex::new(Topology::default()),
            }),
        }
    }

    /// While unreachable, every `connect` fails with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every open connection, as if the broker went away.
    pub fn sever(&self) {
        let mut topology = self.state.lock();
        for connection in topology.connections.drain(..) {
            connection.cancel();
        }
        for queue in topology.queues.values_mut() {
            queue.consumers.clear();
        }
        tracing::debug!("In-process broker severed all connections");
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.state.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.state.rejected.load(Ordering::SeqCst)
    }

    /// Raw payloads in publish order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state.lock().published.clone()
    }

    /// Published payloads that decode as events.
    pub fn published_events(&self) -> Vec<Event> {
        self.published()
            .iter()
            .filter_map(|payload| codec::decode(payload).ok())
            .collect()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.pending.len())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.state.lock().bindings.contains(&binding)
    }

    /// Publish arbitrary bytes, bypassing the event codec.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        self.state.route(exchange, routing_key, payload)
    }
}

impl BrokerState {
    fn lock(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        let mut topology = self.lock();
        let kind = *topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| QueueError::Protocol(format!("no exchange '{}'", exchange)))?;

        topology.published.push(payload.clone());

        let targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for name in targets {
            if let Some(queue) = topology.queues.get_mut(&name) {
                queue.pending.push_back(payload.clone());
                self.flush(&name, queue);
            }
        }
        Ok(())
    }

    /// Flush `name` again. Called whenever a delivery is settled, which
    /// means its consumer has taken it off the buffer.
    fn refill(self: &Arc<Self>, name: &str) {
        let mut topology = self.lock();
        if let Some(queue) = topology.queues.get_mut(name) {
            self.flush(name, queue);
        }
    }

    /// Hand pending messages to live consumers, round robin, until every
    /// consumer buffer is full. Whatever is left waits for the next
    /// settlement, publish or consume.
    fn flush(self: &Arc<Self>, name: &str, queue: &mut QueueState) {
        queue
            .consumers
            .retain(|c| !c.connection.is_cancelled() && !c.sender.is_closed());

        'pending: while let Some(payload) = queue.pending.pop_front() {
            for _ in 0..queue.consumers.len() {
                let idx = queue.next % queue.consumers.len();
                queue.next = queue.next.wrapping_add(1);

                let delivery = self.delivery(name, payload.clone());
                if queue.consumers[idx].sender.try_send(delivery).is_ok() {
                    continue 'pending;
                }
            }
            queue.pending.push_front(payload);
            break;
        }
    }

    fn delivery(self: &Arc<Self>, queue: &str, payload: Vec<u8>) -> Delivery {
        let acker = MemoryAcker {
            state: Arc::clone(self),
            queue: queue.to_string(),
            body: payload.clone(),
        };
        Delivery::new(payload, Box::new(acker))
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    body: Vec<u8>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        self.state.refill(&self.queue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.state.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue {
            let mut topology = self.state.lock();
            if let Some(queue) = topology.queues.get_mut(&self.queue) {
                queue.pending.push_front(self.body.clone());
            }
        }
        self.state.refill(&self.queue);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }

        let closed = CancellationToken::new();
        self.state.lock().connections.push(closed.clone());

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            closed,
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    closed: CancellationToken,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Connection("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut topology = self.state.lock();
        match topology.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(QueueError::Protocol(format!(
                "exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.state.lock().queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut topology = self.state.lock();
        if !topology.exchanges.contains_key(exchange) {
            return Err(QueueError::Protocol(format!("no exchange '{}'", exchange)));
        }
        if !topology.queues.contains_key(queue) {
            return Err(QueueError::Protocol(format!("no queue '{}'", queue)));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !topology.bindings.contains(&binding) {
            topology.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.state.route(exchange, routing_key, payload)
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, QueueError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);

        let mut topology = self.state.lock();
        let state = topology
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Protocol(format!("no queue '{}'", queue)))?;
        state.consumers.push(QueueConsumer {
            connection: self.closed.clone(),
            sender,
        });
        self.state.flush(queue, state);

        Ok(receiver)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.cancel();
        let mut topology = self.state.lock();
        topology.connections.retain(|c| !c.is_cancelled());
        for queue in topology.queues.values_mut() {
            queue.consumers.retain(|c| !c.connection.is_cancelled());
        }
        Ok(())
    }
}
