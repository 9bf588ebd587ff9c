//! # Teamline Events - Integration Event Envelope and Catalog
//!
//! Defines the self-describing envelope carried by every fact published on
//! the integration event bus, plus the catalog of events the Teamline
//! services exchange.
//!
//! ## Envelope
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Envelope (one flat JSON document on the wire)            │
//! │                                                          │
//! │  metadata: id, createdAt, correlationId, eventName,      │
//! │            schemaVersion, sourceService                  │
//! │  payload:  variant-specific fields, merged at top level  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Rules
//!
//! - `id` and `createdAt` are assigned exactly once: freshly by
//!   [`Envelope::publish`], or preserved verbatim by [`Envelope::from_wire`].
//! - Deliberate re-publication goes through [`Envelope::with_new_id`], which
//!   is the only operation that mints a new identity for existing content.
//!
//! ## Event Catalog
//!
//! Concrete events are immutable value objects declaring a name and a
//! routing key through the [`IntegrationEvent`] descriptor. See [`catalog`].

pub mod catalog;
pub mod envelope;

// Re-export main types
pub use catalog::{
    ChatMessageSent, CheckpointCompleted, DocumentUploaded, NotificationDispatched, TaskAssigned,
    UserRegistered,
};
pub use envelope::{
    default_routing_key, Envelope, EnvelopeError, EventMetadata, IntegrationEvent,
};

/// Schema version stamped on freshly published events.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

/// Content type declared on every published message body.
pub const CONTENT_TYPE_JSON: &str = "application/json";
