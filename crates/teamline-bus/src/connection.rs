//! # Connection Manager
//!
//! Owns the lifecycle of exactly one logical broker connection.
//!
//! ## State Machine
//!
//! ```text
//! [Disconnected] ──try_connect()──→ [Connecting] ──success──→ [Connected]
//!       ↑                                │                        │
//!       └──────── retry exhaustion ──────┘                        │
//!       ┌─────────────────────────────────────────────────────────┘
//!       │  shutdown signal / callback fault (self-heal: back to
//!       └─→ [Connecting] and dial again)
//!
//! any state ──shutdown()──→ [ShuttingDown]  (terminal)
//! ```
//!
//! Connection loss is never escalated to publishers or consumers; it is a
//! transient condition handled by backoff retries and the signal-triggered
//! reconnect. Callers observe it only as `try_connect() == false` or a
//! failed [`ConnectionManager::connection`] accessor.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConnection, ConnectionSignal};
use crate::error::BrokerError;
use crate::retry::RetryPolicy;

/// Phase of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; nothing in progress.
    Disconnected,
    /// A connect cycle (with backoff retries) is running.
    Connecting,
    /// One open connection is held.
    Connected,
    /// Terminal; no further connects.
    ShuttingDown,
}

struct StateSlot {
    phase: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    state: Mutex<StateSlot>,
    /// Serializes connect cycles so concurrent `try_connect` calls and
    /// signal-triggered heals do not race each other.
    connect_gate: tokio::sync::Mutex<()>,
}

/// Self-healing owner of one logical broker connection.
///
/// Cheap to clone; clones share the managed connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// A manager for the given endpoint. No connection is attempted until
    /// [`try_connect`](Self::try_connect).
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                policy,
                state: Mutex::new(StateSlot {
                    phase: ConnectionState::Disconnected,
                    connection: None,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Whether an open connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let slot = self.inner.state.lock();
        slot.phase == ConnectionState::Connected
            && slot
                .connection
                .as_ref()
                .is_some_and(|connection| connection.is_open())
    }

    /// The managed connection.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotConnected`] when no open connection is held.
    pub fn connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let slot = self.inner.state.lock();
        match slot.connection.as_ref() {
            Some(connection) if slot.phase == ConnectionState::Connected && connection.is_open() => {
                Ok(connection.clone())
            }
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Establish the connection if it is not already up.
    ///
    /// No-op returning `true` when connected. Otherwise dials with
    /// exponential backoff (per the configured [`RetryPolicy`]); every
    /// failure is logged with the attempt number and the next delay.
    /// Returns `false` - never an error - when retries are exhausted or
    /// the manager is shutting down.
    pub async fn try_connect(&self) -> bool {
        Self::connect_with_retries(&self.inner).await
    }

    /// Terminal shutdown: closes the connection and refuses future
    /// connects.
    pub async fn shutdown(&self) {
        let connection = {
            let mut slot = self.inner.state.lock();
            slot.phase = ConnectionState::ShuttingDown;
            slot.connection.take()
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!("Connection manager shut down");
    }

    async fn connect_with_retries(inner: &Arc<Inner>) -> bool {
        let _gate = inner.connect_gate.lock().await;

        {
            let mut slot = inner.state.lock();
            match slot.phase {
                ConnectionState::ShuttingDown => return false,
                ConnectionState::Connected
                    if slot
                        .connection
                        .as_ref()
                        .is_some_and(|connection| connection.is_open()) =>
                {
                    return true;
                }
                _ => {
                    slot.phase = ConnectionState::Connecting;
                    slot.connection = None;
                }
            }
        }

        let mut attempt = 1u32;
        loop {
            match inner.broker.connect().await {
                Ok(connection) => {
                    let shutting_down = {
                        let mut slot = inner.state.lock();
                        if slot.phase == ConnectionState::ShuttingDown {
                            true
                        } else {
                            slot.phase = ConnectionState::Connected;
                            slot.connection = Some(connection.clone());
                            false
                        }
                    };
                    if shutting_down {
                        connection.close().await;
                        return false;
                    }

                    info!(attempt, "Broker connection established");
                    Self::watch_signals(inner, &connection);
                    return true;
                }
                Err(error) => {
                    if !inner.policy.has_retry_after(attempt) {
                        inner.state.lock().phase = ConnectionState::Disconnected;
                        error!(
                            attempts = attempt,
                            %error,
                            "Could not connect to broker, giving up"
                        );
                        return false;
                    }

                    let delay = inner.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Broker connect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Attach the lifecycle observers: shutdown and callback faults
    /// trigger an immediate reconnect; blocked/unblocked are logged only.
    fn watch_signals(inner: &Arc<Inner>, connection: &Arc<dyn BrokerConnection>) {
        let inner = inner.clone();
        let mut signals = connection.signals();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(ConnectionSignal::Shutdown { reason }) => {
                        warn!(%reason, "Broker connection shut down, reconnecting");
                        Self::heal(&inner).await;
                        break;
                    }
                    Ok(ConnectionSignal::CallbackFault { detail }) => {
                        warn!(%detail, "Broker connection callback faulted, reconnecting");
                        Self::heal(&inner).await;
                        break;
                    }
                    Ok(ConnectionSignal::Blocked { reason }) => {
                        warn!(%reason, "Broker reported connection blocked");
                    }
                    Ok(ConnectionSignal::Unblocked) => {
                        info!("Broker reported connection unblocked");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed connection signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Drop the current connection and dial again. No-op once shutting
    /// down.
    async fn heal(inner: &Arc<Inner>) {
        let stale = {
            let mut slot = inner.state.lock();
            if slot.phase == ConnectionState::ShuttingDown {
                return;
            }
            slot.phase = ConnectionState::Connecting;
            slot.connection.take()
        };
        if let Some(connection) = stale {
            connection.close().await;
        }

        let _ = Self::connect_with_retries(inner).await;
    }
}
