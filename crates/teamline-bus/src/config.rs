//! # Bus Configuration
//!
//! Broker topology and retry parameters for one bus instance, with sane
//! defaults and environment overrides.
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `TEAMLINE_BUS_EXCHANGE` | `exchange` |
//! | `TEAMLINE_BUS_QUEUE` | `queue` |
//! | `TEAMLINE_BUS_DEAD_LETTER_EXCHANGE` | `dead_letter_exchange` |
//! | `TEAMLINE_BUS_MESSAGE_TTL_SECS` | `message_ttl` |
//! | `TEAMLINE_BUS_DELIVERY_LIMIT` | `delivery_limit` (0 disables) |
//! | `TEAMLINE_BUS_CONNECT_ATTEMPTS` | `retry.max_attempts` |

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::broker::{ExchangeSpec, QueueSpec};
use crate::retry::RetryPolicy;

/// Default exchange every service publishes to.
pub const DEFAULT_EXCHANGE: &str = "teamline.events";

/// Default time a message may wait in a queue before dead-lettering.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default redeliveries before a message is dead-lettered.
pub const DEFAULT_DELIVERY_LIMIT: u32 = 10;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A topology name is empty.
    #[error("Configuration field `{field}` must not be empty")]
    EmptyName { field: &'static str },

    /// The message TTL is zero, which would dead-letter everything.
    #[error("Message TTL must be greater than zero")]
    ZeroMessageTtl,

    /// The retry policy allows no attempt at all.
    #[error("Retry policy must allow at least one attempt")]
    NoAttempts,
}

/// Settings for one bus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Name of the service owning this bus instance; stamped on every
    /// published envelope.
    pub source_service: String,
    /// Durable direct exchange shared by all services.
    pub exchange: String,
    /// This service instance's durable queue.
    pub queue: String,
    /// Exchange receiving expired and over-redelivered messages.
    pub dead_letter_exchange: String,
    /// Queue residency limit before dead-lettering.
    pub message_ttl: Duration,
    /// Redelivery cap before dead-lettering; `None` disables the cap.
    pub delivery_limit: Option<u32>,
    /// Backoff schedule shared by the connect and publish paths.
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::for_service("teamline")
    }
}

impl BusConfig {
    /// Defaults for a named service: shared exchange, per-service queue.
    #[must_use]
    pub fn for_service(source_service: &str) -> Self {
        Self {
            source_service: source_service.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: format!("{DEFAULT_EXCHANGE}.{source_service}"),
            dead_letter_exchange: format!("{DEFAULT_EXCHANGE}.dead-letter"),
            message_ttl: DEFAULT_MESSAGE_TTL,
            delivery_limit: Some(DEFAULT_DELIVERY_LIMIT),
            retry: RetryPolicy::default(),
        }
    }

    /// Defaults for a named service with environment overrides applied.
    #[must_use]
    pub fn from_env(source_service: &str) -> Self {
        let mut config = Self::for_service(source_service);

        if let Ok(exchange) = env::var("TEAMLINE_BUS_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Ok(queue) = env::var("TEAMLINE_BUS_QUEUE") {
            config.queue = queue;
        }
        if let Ok(dlx) = env::var("TEAMLINE_BUS_DEAD_LETTER_EXCHANGE") {
            config.dead_letter_exchange = dlx;
        }
        if let Some(secs) = parse_env("TEAMLINE_BUS_MESSAGE_TTL_SECS") {
            config.message_ttl = Duration::from_secs(secs);
        }
        if let Some(limit) = parse_env::<u32>("TEAMLINE_BUS_DELIVERY_LIMIT") {
            config.delivery_limit = (limit > 0).then_some(limit);
        }
        if let Some(attempts) = parse_env::<u32>("TEAMLINE_BUS_CONNECT_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }

        config
    }

    /// Validate before wiring a bus.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_service.is_empty() {
            return Err(ConfigError::EmptyName {
                field: "source_service",
            });
        }
        if self.exchange.is_empty() {
            return Err(ConfigError::EmptyName { field: "exchange" });
        }
        if self.queue.is_empty() {
            return Err(ConfigError::EmptyName { field: "queue" });
        }
        if self.dead_letter_exchange.is_empty() {
            return Err(ConfigError::EmptyName {
                field: "dead_letter_exchange",
            });
        }
        if self.message_ttl.is_zero() {
            return Err(ConfigError::ZeroMessageTtl);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }

    /// Declaration of the shared events exchange.
    #[must_use]
    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.clone(),
            durable: true,
        }
    }

    /// Declaration of the dead-letter exchange paired with the events
    /// exchange.
    #[must_use]
    pub fn dead_letter_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.dead_letter_exchange.clone(),
            durable: true,
        }
    }

    /// Declaration of this service instance's queue, wired for poison
    /// containment.
    #[must_use]
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: true,
            message_ttl: self.message_ttl,
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
            delivery_limit: self.delivery_limit,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}
