//! # Teamline Bus - Integration Event Bus
//!
//! Reliable publish/subscribe between independently deployed Teamline
//! services, with no direct calls between them.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │  Chat svc    │                    │ Notification │
//! │              │    publish()       │     svc      │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐           │ dispatch
//!                  │  Event Bus   │ ──────────┘ (ack / requeue)
//!                  │   + broker   │
//!                  └──────────────┘  subscribe()
//! ```
//!
//! ## Components
//!
//! - [`SubscriptionRegistry`] - event-name → handler registrations.
//! - [`ConnectionManager`] - owns and self-heals one broker connection.
//! - [`broker`] - the broker port plus the in-process implementation.
//! - [`EventBus`] - publish path and the consume/dispatch loop.
//!
//! ## Delivery Contract
//!
//! At-least-once to a single logical broker. A failed handler requeues
//! the whole message, so handlers must be idempotent; messages that
//! exceed the queue TTL or delivery limit are dead-lettered instead of
//! looping forever. There are no cross-event ordering guarantees.

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod stats;

// Re-export main types
pub use broker::in_process::InProcessBroker;
pub use broker::{
    Broker, BrokerChannel, BrokerConnection, ConnectionSignal, Delivery, DeliveryStream,
    ExchangeSpec, MessageProperties, QueueSpec,
};
pub use bus::EventBus;
pub use config::{BusConfig, ConfigError, DEFAULT_DELIVERY_LIMIT, DEFAULT_EXCHANGE, DEFAULT_MESSAGE_TTL};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{
    BrokerError, ConsumeError, DispatchError, HandlerError, PublishError, SubscribeError,
    SubscriptionError,
};
pub use handler::{DynamicEventHandler, EventHandler, HandlerId};
pub use registry::{HandlerKind, RemovalOutcome, Subscription, SubscriptionRegistry};
pub use retry::RetryPolicy;
pub use stats::{BusStatistics, StatsSnapshot};
