//! # In-Process Broker
//!
//! Single-process implementation of the broker port with full queue
//! semantics: exact-match direct routing, one-at-a-time delivery per
//! consumer (the next message is handed out only after the previous one
//! is settled), FIFO redelivery at the front of the queue, per-queue
//! message TTL and delivery limits with dead-letter routing, and
//! connection lifecycle signals.
//!
//! Suitable for single-node deployments and as the test double for
//! everything built on the port; distributed deployments connect a remote
//! broker adapter instead. Broker-side state (exchanges, queues, bindings,
//! messages) survives connection loss, like a real broker's would.
//!
//! Failure injection for tests: scripted connect refusals, forced
//! connection shutdown, callback faults, and blocked/unblocked signals.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, ConnectionSignal, Delivery, DeliveryStream,
    ExchangeSpec, MessageProperties, QueueSpec,
};
use crate::error::BrokerError;

/// Deliveries buffered per consumer before backpressure.
const CONSUMER_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle signals buffered per connection.
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// Unsettled deliveries allowed per queue consumer.
const PREFETCH_LIMIT: u32 = 1;

#[derive(Clone)]
struct QueuedMessage {
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    enqueued_at: Instant,
    /// Deliveries so far, including any in flight.
    delivery_count: u32,
}

struct ConsumerSeat {
    tx: mpsc::Sender<Delivery>,
    channel_id: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    consumer: Option<ConsumerSeat>,
    /// Deliveries awaiting ack/nack for this queue.
    in_flight: u32,
}

#[derive(Default)]
struct ExchangeState {
    /// routing key → bound queue names; exact-match routing.
    bindings: HashMap<String, BTreeSet<String>>,
}

struct InFlight {
    queue: String,
    channel_id: u64,
    message: QueuedMessage,
}

/// A message taken off a queue that must be dead-lettered, with the
/// origin queue's dead-letter exchange (if any) and the reason.
struct DeadLetter {
    dlx: Option<String>,
    message: QueuedMessage,
    reason: &'static str,
}

/// Broker-side state shared by every connection and channel.
#[derive(Default)]
struct BrokerCore {
    exchanges: Mutex<HashMap<String, ExchangeState>>,
    queues: Mutex<HashMap<String, Arc<Mutex<QueueState>>>>,
    unacked: Mutex<HashMap<u64, InFlight>>,
    next_delivery_tag: AtomicU64,
    next_channel_id: AtomicU64,
    dead_lettered: AtomicU64,
    unroutable: AtomicU64,
}

impl BrokerCore {
    fn queue(&self, name: &str) -> Result<Arc<Mutex<QueueState>>, BrokerError> {
        self.queues
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue {
                queue: name.to_string(),
            })
    }

    /// Hand ready messages to the queue's consumer, up to the prefetch
    /// limit. Returns expired messages for the caller to dead-letter.
    fn pump(&self, queue_name: &str, queue: &Arc<Mutex<QueueState>>) -> Vec<DeadLetter> {
        let mut expired = Vec::new();
        let mut state = queue.lock();

        loop {
            if state.in_flight >= PREFETCH_LIMIT {
                break;
            }
            let (tx, channel_id) = match state.consumer.as_ref() {
                Some(seat) => (seat.tx.clone(), seat.channel_id),
                None => break,
            };
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };

            if message.enqueued_at.elapsed() >= state.spec.message_ttl {
                expired.push(DeadLetter {
                    dlx: state.spec.dead_letter_exchange.clone(),
                    message,
                    reason: "message TTL exceeded",
                });
                continue;
            }

            message.delivery_count += 1;
            let tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
                redelivered: message.delivery_count > 1,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            match tx.try_send(delivery) {
                Ok(()) => {
                    state.in_flight += 1;
                    self.unacked.lock().insert(
                        tag,
                        InFlight {
                            queue: queue_name.to_string(),
                            channel_id,
                            message,
                        },
                    );
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    message.delivery_count -= 1;
                    state.ready.push_front(message);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    message.delivery_count -= 1;
                    state.ready.push_front(message);
                    state.consumer = None;
                    break;
                }
            }
        }

        expired
    }

    /// Route one message through an exchange to every queue bound under
    /// its routing key.
    fn route(&self, exchange: &str, message: QueuedMessage) -> Result<(), BrokerError> {
        let targets: Vec<String> = {
            let exchanges = self.exchanges.lock();
            let state = exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange {
                    exchange: exchange.to_string(),
                })?;
            state
                .bindings
                .get(&message.routing_key)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            trace!(
                exchange,
                routing_key = %message.routing_key,
                "No queue bound for routing key, message dropped"
            );
            return Ok(());
        }

        for queue_name in targets {
            let Ok(queue) = self.queue(&queue_name) else {
                continue;
            };
            queue.lock().ready.push_back(message.clone());
            let expired = self.pump(&queue_name, &queue);
            self.finish_dead_letters(expired);
        }

        Ok(())
    }

    /// Forward messages to their dead-letter exchange, or drop when the
    /// origin queue declared none.
    fn finish_dead_letters(&self, letters: Vec<DeadLetter>) {
        for letter in letters {
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            let routing_key = letter.message.routing_key.clone();
            match letter.dlx {
                Some(dlx) => {
                    debug!(
                        exchange = %dlx,
                        routing_key = %routing_key,
                        reason = letter.reason,
                        "Message dead-lettered"
                    );
                    let mut message = letter.message;
                    message.delivery_count = 0;
                    message.enqueued_at = Instant::now();
                    if let Err(error) = self.route(&dlx, message) {
                        warn!(%error, "Dead-letter exchange missing, message dropped");
                    }
                }
                None => {
                    warn!(
                        routing_key = %routing_key,
                        reason = letter.reason,
                        "No dead-letter exchange declared, message dropped"
                    );
                }
            }
        }
    }

    /// Settle one in-flight delivery for a queue and hand out the next
    /// ready message.
    fn settle_and_pump(&self, queue_name: &str) {
        if let Ok(queue) = self.queue(queue_name) {
            {
                let mut state = queue.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            let expired = self.pump(queue_name, &queue);
            self.finish_dead_letters(expired);
        }
    }

    /// Requeue every unacknowledged delivery owned by a closing channel.
    fn requeue_channel(&self, channel_id: u64) {
        let orphaned: Vec<InFlight> = {
            let mut unacked = self.unacked.lock();
            let tags: Vec<u64> = unacked
                .iter()
                .filter(|(_, inflight)| inflight.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| unacked.remove(&tag))
                .collect()
        };

        for inflight in orphaned {
            if let Ok(queue) = self.queue(&inflight.queue) {
                {
                    let mut state = queue.lock();
                    state.in_flight = state.in_flight.saturating_sub(1);
                    state.ready.push_front(inflight.message);
                }
                let expired = self.pump(&inflight.queue, &queue);
                self.finish_dead_letters(expired);
            }
        }
    }
}

/// In-process broker endpoint.
pub struct InProcessBroker {
    core: Arc<BrokerCore>,
    refuse_connects: AtomicU32,
    connections: Mutex<Vec<Arc<InProcessConnection>>>,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBroker {
    /// A broker with no declared topology.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore::default()),
            refuse_connects: AtomicU32::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Refuse the next `count` connect attempts with
    /// [`BrokerError::Unreachable`].
    pub fn fail_next_connects(&self, count: u32) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Shut down every open connection, emitting a shutdown signal first.
    /// Broker-side topology and messages are retained.
    pub fn drop_connections(&self, reason: &str) {
        let connections: Vec<Arc<InProcessConnection>> =
            self.connections.lock().drain(..).collect();
        for connection in connections {
            let _ = connection.signal_tx.send(ConnectionSignal::Shutdown {
                reason: reason.to_string(),
            });
            connection.close_now();
        }
    }

    /// Emit a callback fault on every open connection.
    pub fn emit_callback_fault(&self, detail: &str) {
        for connection in self.connections.lock().iter() {
            let _ = connection.signal_tx.send(ConnectionSignal::CallbackFault {
                detail: detail.to_string(),
            });
        }
    }

    /// Emit a blocked signal on every open connection.
    pub fn block(&self, reason: &str) {
        for connection in self.connections.lock().iter() {
            let _ = connection.signal_tx.send(ConnectionSignal::Blocked {
                reason: reason.to_string(),
            });
        }
    }

    /// Emit an unblocked signal on every open connection.
    pub fn unblock(&self) {
        for connection in self.connections.lock().iter() {
            let _ = connection.signal_tx.send(ConnectionSignal::Unblocked);
        }
    }

    /// Number of currently open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|connection| connection.is_open())
            .count()
    }

    /// Messages waiting (not in flight) on a queue.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.core
            .queues
            .lock()
            .get(queue)
            .map(|state| state.lock().ready.len())
            .unwrap_or(0)
    }

    /// Whether a queue is bound to an exchange under a routing key.
    #[must_use]
    pub fn is_bound(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.core
            .exchanges
            .lock()
            .get(exchange)
            .and_then(|state| state.bindings.get(routing_key))
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Total messages routed to a dead-letter exchange (or dropped for
    /// the lack of one).
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.core.dead_lettered.load(Ordering::Relaxed)
    }

    /// Total published messages that matched no binding.
    #[must_use]
    pub fn unroutable(&self) -> u64 {
        self.core.unroutable.load(Ordering::Relaxed)
    }

    /// Deliveries currently awaiting acknowledgment.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.core.unacked.lock().len()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let remaining = self.refuse_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refuse_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Unreachable {
                detail: "connection refused".to_string(),
            });
        }

        let (signal_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let connection = Arc::new(InProcessConnection {
            core: self.core.clone(),
            open: AtomicBool::new(true),
            signal_tx,
            channels: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// One open connection to the in-process broker.
pub struct InProcessConnection {
    core: Arc<BrokerCore>,
    open: AtomicBool,
    signal_tx: broadcast::Sender<ConnectionSignal>,
    channels: Mutex<Vec<Arc<InProcessChannel>>>,
}

impl InProcessConnection {
    fn close_now(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Arc<InProcessChannel>> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.close_now();
        }
    }
}

#[async_trait]
impl BrokerConnection for InProcessConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn signals(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.signal_tx.subscribe()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }
        let channel = Arc::new(InProcessChannel {
            id: self.core.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1,
            core: self.core.clone(),
            open: AtomicBool::new(true),
            consumed_queues: Mutex::new(Vec::new()),
        });
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        self.close_now();
    }
}

/// One channel on an in-process connection.
pub struct InProcessChannel {
    id: u64,
    core: Arc<BrokerCore>,
    open: AtomicBool,
    consumed_queues: Mutex<Vec<String>>,
}

impl InProcessChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn close_now(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // Release consumer seats held by this channel.
        for queue_name in self.consumed_queues.lock().drain(..) {
            if let Ok(queue) = self.core.queue(&queue_name) {
                let mut state = queue.lock();
                if state
                    .consumer
                    .as_ref()
                    .is_some_and(|seat| seat.channel_id == self.id)
                {
                    state.consumer = None;
                }
            }
        }

        // Unacknowledged deliveries go back to their queues.
        self.core.requeue_channel(self.id);
    }
}

#[async_trait]
impl BrokerChannel for InProcessChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .exchanges
            .lock()
            .entry(spec.name.clone())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core
            .queues
            .lock()
            .entry(spec.name.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(QueueState {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                    consumer: None,
                    in_flight: 0,
                }))
            });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !self.core.queues.lock().contains_key(queue) {
            return Err(BrokerError::UnknownQueue {
                queue: queue.to_string(),
            });
        }

        let mut exchanges = self.core.exchanges.lock();
        let state = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange {
                exchange: exchange.to_string(),
            })?;
        state
            .bindings
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut exchanges = self.core.exchanges.lock();
        let state = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange {
                exchange: exchange.to_string(),
            })?;
        if let Some(queues) = state.bindings.get_mut(routing_key) {
            queues.remove(queue);
            if queues.is_empty() {
                state.bindings.remove(routing_key);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.core.route(
            exchange,
            QueuedMessage {
                routing_key: routing_key.to_string(),
                properties,
                body,
                enqueued_at: Instant::now(),
                delivery_count: 0,
            },
        )
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let state = self.core.queue(queue)?;
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);

        {
            let mut locked = state.lock();
            if locked.consumer.is_some() {
                return Err(BrokerError::ConsumerConflict {
                    queue: queue.to_string(),
                });
            }
            locked.consumer = Some(ConsumerSeat {
                tx,
                channel_id: self.id,
            });
        }

        self.consumed_queues.lock().push(queue.to_string());
        debug!(queue, consumer_tag, "Consumer attached");

        let expired = self.core.pump(queue, &state);
        self.core.finish_dead_letters(expired);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let inflight = self
            .core
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag { tag: delivery_tag })?;
        self.core.settle_and_pump(&inflight.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let inflight = self
            .core
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag { tag: delivery_tag })?;

        let queue = self.core.queue(&inflight.queue)?;
        let (dlx, delivery_limit) = {
            let mut state = queue.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            (
                state.spec.dead_letter_exchange.clone(),
                state.spec.delivery_limit,
            )
        };

        let over_limit =
            delivery_limit.is_some_and(|limit| inflight.message.delivery_count >= limit);
        if !requeue || over_limit {
            let reason = if requeue {
                "delivery limit exceeded"
            } else {
                "rejected without requeue"
            };
            self.core.finish_dead_letters(vec![DeadLetter {
                dlx,
                message: inflight.message,
                reason,
            }]);
        } else {
            queue.lock().ready.push_front(inflight.message);
        }

        let expired = self.core.pump(&inflight.queue, &queue);
        self.core.finish_dead_letters(expired);
        Ok(())
    }

    async fn close(&self) {
        self.close_now();
    }
}
