//! # Broker Port
//!
//! The seam between the bus and the single logical message broker.
//!
//! ```text
//! ┌──────────────┐ connect() ┌──────────────────┐ create_channel() ┌───────────────┐
//! │    Broker    │ ─────────→│ BrokerConnection │ ────────────────→│ BrokerChannel │
//! │  (endpoint)  │           │  (one, owned by  │                  │ short-lived:  │
//! └──────────────┘           │   the manager)   │                  │   publish     │
//!                            └──────────────────┘                  │ long-lived:   │
//!                                                                  │   consume     │
//!                                                                  └───────────────┘
//! ```
//!
//! Topology contract: one durable direct exchange, one durable queue per
//! consuming service instance, a dead-letter exchange per base exchange,
//! and a configurable message TTL. Implementations must route by exact
//! routing-key match and redeliver negatively-acknowledged messages in
//! FIFO order.
//!
//! The in-process implementation lives in [`in_process`]; a remote AMQP
//! adapter implements the same three traits.

pub mod in_process;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;

/// Declaration of a durable direct exchange. Idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
}

/// Declaration of a durable queue with poison-message containment
/// arguments. Idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survives broker restart.
    pub durable: bool,
    /// Messages older than this are dead-lettered instead of delivered.
    pub message_ttl: Duration,
    /// Exchange that receives expired or over-redelivered messages.
    pub dead_letter_exchange: Option<String>,
    /// Redeliveries allowed before a message is dead-lettered.
    pub delivery_limit: Option<u32>,
}

/// Metadata set on every published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Equals the event id.
    pub message_id: String,
    /// Unix timestamp (seconds) of event creation.
    pub timestamp: u64,
    /// Declared body content type.
    pub content_type: String,
    /// Persistent delivery mode.
    pub persistent: bool,
    /// Propagated when the event carries one.
    pub correlation_id: Option<String>,
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag for ack/nack.
    pub delivery_tag: u64,
    /// Routing key the message was published under.
    pub routing_key: String,
    /// True when this delivery is a redelivery after a requeue.
    pub redelivered: bool,
    /// Message metadata.
    pub properties: MessageProperties,
    /// Serialized envelope document.
    pub body: Vec<u8>,
}

/// Lifecycle signals a connection emits after it is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection was shut down; the owner should reconnect.
    Shutdown {
        /// Broker-provided close reason.
        reason: String,
    },
    /// A connection-level callback faulted; treated like a shutdown.
    CallbackFault {
        /// Fault description.
        detail: String,
    },
    /// The broker stopped accepting publishes (resource exhaustion).
    Blocked {
        /// Broker-provided reason.
        reason: String,
    },
    /// The broker resumed accepting publishes.
    Unblocked,
}

/// Receiving half of a consumer: deliveries arrive in queue FIFO order.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

/// A broker endpoint that can be dialed.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Attempt to establish one logical connection.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Unreachable`] when the endpoint does not accept the
    /// connection; callers are expected to retry with backoff.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One logical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Subscribe to lifecycle signals (shutdown, blocked, unblocked).
    fn signals(&self) -> broadcast::Receiver<ConnectionSignal>;

    /// Open a channel for publishing or consuming.
    ///
    /// # Errors
    ///
    /// [`BrokerError::ConnectionClosed`] when the connection is down.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Close the connection and every channel opened on it.
    async fn close(&self);
}

/// A unit of work on a connection.
///
/// Publishes use a short-lived channel per call; consumption holds one
/// long-lived channel. Unacknowledged deliveries are requeued when the
/// channel closes.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable direct exchange. Idempotent.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a durable queue with its containment arguments. Idempotent.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange under a routing key. Idempotent.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Remove a queue↔exchange binding for a routing key.
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish one message to an exchange under a routing key.
    ///
    /// Success means the broker accepted the message on this channel, not
    /// that it was durably committed beyond the broker's own guarantees.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Begin delivery from a queue. At most one consumer per queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Acknowledge a delivery; the broker discards the message.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery. With `requeue` the message is
    /// redelivered (FIFO, `redelivered` flag set) unless it exceeded the
    /// queue's delivery limit, in which case it is dead-lettered; without
    /// `requeue` it is dead-lettered immediately.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel. Outstanding unacknowledged deliveries requeue.
    async fn close(&self);
}
