//! # Event Handlers
//!
//! The consuming side of the bus: typed handlers bound to a concrete event
//! type at setup time, and dynamic handlers bound only by event-name
//! string, receiving the raw parsed payload.
//!
//! Handlers are resolved through a factory per delivered message, so no
//! handler-local state is shared across concurrent messages. Dispatch by
//! name goes through erased invoker closures captured at registration;
//! the name→type mapping is fixed at compile time, with no runtime type
//! lookup.
//!
//! ## Required Invariant
//!
//! Delivery is at-least-once and a failed handler requeues the whole
//! message for **all** of its handlers. Every handler must therefore be
//! idempotent against duplicate delivery.

use std::any::{type_name, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use teamline_events::{Envelope, EventMetadata, IntegrationEvent};

use crate::error::{DispatchError, HandlerError};

/// Identity of a handler type, used to reject duplicate registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    type_id: TypeId,
    label: &'static str,
}

impl HandlerId {
    /// The identity of handler type `H`.
    #[must_use]
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            label: type_name::<H>(),
        }
    }

    /// Human-readable type name, for logs and errors.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// A handler bound to a concrete event type.
#[async_trait]
pub trait EventHandler<E: IntegrationEvent>: Send + Sync {
    /// React to one delivered event.
    ///
    /// # Errors
    ///
    /// A returned [`HandlerError`] requeues the whole message.
    async fn handle(&self, event: E, meta: &EventMetadata) -> Result<(), HandlerError>;
}

/// A handler bound only by event-name string.
///
/// Receives the parsed-but-untyped payload document, without a
/// compile-time dependency on the event type.
#[async_trait]
pub trait DynamicEventHandler: Send + Sync {
    /// React to one delivered event payload.
    ///
    /// # Errors
    ///
    /// A returned [`HandlerError`] requeues the whole message.
    async fn handle(&self, payload: Value, meta: &EventMetadata) -> Result<(), HandlerError>;
}

/// Type-erased dispatch closure stored in the subscription registry.
///
/// Captures the concrete event/handler pair at registration time;
/// invocation needs only the envelope.
#[async_trait]
pub trait ErasedInvoker: Send + Sync {
    /// Resolve a fresh handler instance and invoke it for this envelope.
    async fn invoke(&self, envelope: &Envelope) -> Result<(), DispatchError>;
}

struct TypedInvoker<E, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (E, H)>,
}

#[async_trait]
impl<E, H, F> ErasedInvoker for TypedInvoker<E, H, F>
where
    E: IntegrationEvent,
    H: EventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync,
{
    async fn invoke(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let event: E = envelope.decode()?;
        let handler = (self.factory)();
        handler.handle(event, &envelope.meta).await?;
        Ok(())
    }
}

struct DynamicInvoker<H, F> {
    factory: F,
    _marker: PhantomData<fn() -> H>,
}

#[async_trait]
impl<H, F> ErasedInvoker for DynamicInvoker<H, F>
where
    H: DynamicEventHandler + 'static,
    F: Fn() -> H + Send + Sync,
{
    async fn invoke(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let handler = (self.factory)();
        let payload = Value::Object(envelope.payload.clone());
        handler.handle(payload, &envelope.meta).await?;
        Ok(())
    }
}

/// Erase a typed handler factory into a registry invoker.
pub(crate) fn erase_typed<E, H, F>(factory: F) -> Arc<dyn ErasedInvoker>
where
    E: IntegrationEvent,
    H: EventHandler<E> + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(TypedInvoker::<E, H, F> {
        factory,
        _marker: PhantomData,
    })
}

/// Erase a dynamic handler factory into a registry invoker.
pub(crate) fn erase_dynamic<H, F>(factory: F) -> Arc<dyn ErasedInvoker>
where
    H: DynamicEventHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(DynamicInvoker::<H, F> {
        factory,
        _marker: PhantomData,
    })
}
