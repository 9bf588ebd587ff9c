//! # Subscription Registry
//!
//! In-memory table of event-name → handler registrations, shared between
//! the setup path (subscribe/unsubscribe) and the dispatch loop.
//!
//! All state sits behind one coarse mutex: subscriptions churn only at
//! service startup and shutdown, so contention is not a concern. Queries
//! hand out snapshots, never live references, so concurrent mutation
//! cannot corrupt an in-progress dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::SubscriptionError;
use crate::handler::{ErasedInvoker, HandlerId};

/// How a handler was bound to its event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Bound to a concrete event type at setup time.
    Typed,
    /// Bound only by event-name string; receives the raw parsed payload.
    Dynamic,
}

/// One handler registration for one event name.
#[derive(Clone)]
pub struct Subscription {
    /// Identity of the handler type; unique per event name.
    pub handler_id: HandlerId,
    /// Typed or dynamic binding.
    pub kind: HandlerKind,
    /// Dispatch closure invoked per delivered message.
    pub invoker: Arc<dyn ErasedInvoker>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handler", &self.handler_id.label())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Notification fired when the last handler for an event name is removed.
pub type RemovalHook = Box<dyn Fn(&str) + Send + Sync>;

/// Outcome of removing a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// True when this removal purged the event name's tracking entry.
    pub purged: bool,
}

/// Event-name → handler registration table.
///
/// Each bus instance owns its own registry; nothing here is global.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Vec<Subscription>>>,
    on_event_removed: Mutex<Option<RemovalHook>>,
}

impl SubscriptionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook fired (synchronously, exactly once) whenever the
    /// last handler for an event name is removed. Replaces any previous
    /// hook.
    pub fn set_removal_hook(&self, hook: RemovalHook) {
        *self.on_event_removed.lock() = Some(hook);
    }

    /// Register a handler for an event name.
    ///
    /// # Errors
    ///
    /// Rejects a second registration of the same handler type for the same
    /// event name.
    pub fn add(&self, event_name: &str, subscription: Subscription) -> Result<(), SubscriptionError> {
        let mut entries = self.entries.lock();
        let registrations = entries.entry(event_name.to_string()).or_default();

        if registrations
            .iter()
            .any(|existing| existing.handler_id == subscription.handler_id)
        {
            return Err(SubscriptionError::DuplicateHandler {
                event_name: event_name.to_string(),
                handler: subscription.handler_id.label(),
            });
        }

        debug!(
            event_name,
            handler = subscription.handler_id.label(),
            kind = ?subscription.kind,
            "Handler registered"
        );
        registrations.push(subscription);
        Ok(())
    }

    /// Remove a handler registration.
    ///
    /// When the last handler for the event name goes, the tracking entry is
    /// purged and the removal hook fires before this returns.
    ///
    /// # Errors
    ///
    /// Fails when the handler is not registered for the event name.
    pub fn remove(
        &self,
        event_name: &str,
        handler_id: HandlerId,
    ) -> Result<RemovalOutcome, SubscriptionError> {
        let purged = {
            let mut entries = self.entries.lock();
            let registrations =
                entries
                    .get_mut(event_name)
                    .ok_or_else(|| SubscriptionError::NotRegistered {
                        event_name: event_name.to_string(),
                        handler: handler_id.label(),
                    })?;

            let position = registrations
                .iter()
                .position(|existing| existing.handler_id == handler_id)
                .ok_or_else(|| SubscriptionError::NotRegistered {
                    event_name: event_name.to_string(),
                    handler: handler_id.label(),
                })?;

            registrations.remove(position);
            if registrations.is_empty() {
                entries.remove(event_name);
                true
            } else {
                false
            }
        };

        debug!(
            event_name,
            handler = handler_id.label(),
            purged,
            "Handler removed"
        );

        if purged {
            if let Some(hook) = self.on_event_removed.lock().as_ref() {
                hook(event_name);
            }
        }

        Ok(RemovalOutcome { purged })
    }

    /// Whether any handler is registered for the event name.
    #[must_use]
    pub fn has_subscriptions(&self, event_name: &str) -> bool {
        self.entries.lock().contains_key(event_name)
    }

    /// Snapshot of the registrations for an event name, in registration
    /// order. Never a live reference.
    #[must_use]
    pub fn handlers_for(&self, event_name: &str) -> Vec<Subscription> {
        self.entries
            .lock()
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of all tracked event names.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Whether no handler is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every registration, without firing removal hooks.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
