//! # Error Taxonomy
//!
//! Four distinct failure families with distinct propagation rules:
//!
//! - [`BrokerError`] - transport faults. Retried with backoff; surfaces to
//!   callers only as `try_connect() == false` or a logged publish drop.
//! - [`SubscriptionError`] - programmer errors at setup time. Returned
//!   synchronously from subscribe/unsubscribe so they fail at service
//!   startup, not during message processing.
//! - [`HandlerError`] - per-message domain failures. Contained by the
//!   dispatch loop (negative-ack + requeue), never propagated further.
//! - [`DispatchError`] - internal dispatch outcome separating a handler
//!   failure (requeue) from a malformed payload (ack-and-drop; a malformed
//!   message cannot become well-formed on redelivery).

use thiserror::Error;
use teamline_events::EnvelopeError;

/// Errors from the broker transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker endpoint did not accept a connection.
    #[error("Broker unreachable: {detail}")]
    Unreachable { detail: String },

    /// No broker connection is currently established.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The connection was shut down mid-operation.
    #[error("Broker connection closed")]
    ConnectionClosed,

    /// The channel was closed mid-operation.
    #[error("Broker channel closed")]
    ChannelClosed,

    /// A publish or bind referenced an exchange that was never declared.
    #[error("Unknown exchange `{exchange}`")]
    UnknownExchange { exchange: String },

    /// A bind or consume referenced a queue that was never declared.
    #[error("Unknown queue `{queue}`")]
    UnknownQueue { queue: String },

    /// An ack or nack referenced a delivery this broker is not tracking.
    #[error("Unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: u64 },

    /// A queue already has an active consumer.
    #[error("Queue `{queue}` already has an active consumer")]
    ConsumerConflict { queue: String },
}

/// Errors from subscription management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The handler type is already registered for this event name.
    #[error("Handler {handler} is already registered for event {event_name}")]
    DuplicateHandler {
        event_name: String,
        handler: &'static str,
    },

    /// The handler type is not registered for this event name.
    #[error("Handler {handler} is not registered for event {event_name}")]
    NotRegistered {
        event_name: String,
        handler: &'static str,
    },
}

/// A per-message handler failure.
///
/// Failed handlers trigger redelivery of the whole message, so every
/// handler must be idempotent against duplicate delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Handler failed: {reason}")]
pub struct HandlerError {
    /// Human-readable failure description, logged with the requeue.
    pub reason: String,
}

impl HandlerError {
    /// Build a handler failure from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of invoking the handlers for one delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The body or payload could not be decoded; ack and drop.
    #[error("Undecodable message: {source}")]
    Malformed {
        #[from]
        source: EnvelopeError,
    },

    /// A handler failed; negative-ack and requeue the whole message.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Errors from the publish path that reach the caller.
///
/// Transport faults never appear here; they are retried and, on
/// exhaustion, logged and dropped (fire-and-forget contract).
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event could not be serialized into an envelope.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Errors from subscribe/unsubscribe setup.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The registration itself was invalid (duplicate or unknown).
    #[error(transparent)]
    Registry(#[from] SubscriptionError),

    /// The broker rejected the queue binding work.
    #[error("Binding failed at the broker: {source}")]
    Broker {
        #[from]
        source: BrokerError,
    },
}

/// Errors from consume setup.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The broker could not be reached, so consumption never starts.
    #[error("Cannot start consuming: {source}")]
    Broker {
        #[from]
        source: BrokerError,
    },

    /// The bus is already consuming.
    #[error("Already consuming")]
    AlreadyConsuming,
}
