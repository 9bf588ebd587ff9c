//! # Integration Event Envelope
//!
//! The universal wrapper for every fact published on the event bus.
//!
//! ## Identity Properties
//!
//! - **Assigned once**: `id` and `created_at` are generated by the
//!   fresh-publish constructor and preserved verbatim by the wire
//!   constructor. Normal transport never regenerates them.
//! - **Correlation**: causally related events across services share a
//!   `correlation_id`.
//! - **Versioning**: `schema_version` defaults to 1 and allows
//!   backward-compatible payload evolution.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::CURRENT_SCHEMA_VERSION;

/// Errors from envelope construction and decoding.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The event payload could not be serialized to JSON.
    #[error("Failed to serialize payload for event {event_name}: {source}")]
    PayloadSerialize {
        event_name: &'static str,
        source: serde_json::Error,
    },

    /// The event payload did not serialize to a JSON object.
    #[error("Payload for event {event_name} must serialize to a JSON object")]
    NonObjectPayload { event_name: &'static str },

    /// A payload field collides with a reserved envelope metadata field.
    #[error("Payload field `{field}` of event {event_name} collides with an envelope field")]
    ReservedField {
        event_name: &'static str,
        field: String,
    },

    /// The wire body was not a well-formed envelope document.
    #[error("Malformed envelope body: {source}")]
    MalformedBody { source: serde_json::Error },

    /// The payload could not be decoded into the requested event type.
    #[error("Failed to decode payload of event {event_name} as {target}: {source}")]
    PayloadDecode {
        event_name: String,
        target: &'static str,
        source: serde_json::Error,
    },
}

/// Contract every concrete integration event declares.
///
/// Variants are immutable value objects: envelope metadata plus a fixed set
/// of payload fields, with no behavior beyond this descriptor.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The event-type name, used as the subscription identity
    /// (e.g. `"ChatMessageSent"`).
    const NAME: &'static str;

    /// The routing key published under, set at declaration.
    ///
    /// Hierarchical dot-delimited keys (e.g. `chat.message.sent`) support
    /// topic-style routing; events that do not need one use the lowercased
    /// type name (see [`default_routing_key`]).
    const ROUTING_KEY: &'static str;
}

/// The lowercased-type-name routing key used by events without a
/// hierarchical key of their own.
#[must_use]
pub fn default_routing_key(event_name: &str) -> String {
    event_name.to_ascii_lowercase()
}

/// Envelope metadata carried by every published fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Globally unique event identifier, assigned once at construction.
    pub id: Uuid,

    /// UTC time of construction, immutable.
    pub created_at: DateTime<Utc>,

    /// Optional link between causally related events across services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Name of the concrete event variant.
    pub event_name: String,

    /// Payload schema version; absent on the wire means version 1.
    #[serde(default = "EventMetadata::default_schema_version")]
    pub schema_version: u16,

    /// Name of the producing service.
    pub source_service: String,
}

impl EventMetadata {
    /// Fresh metadata for a publish-side construction.
    #[must_use]
    pub fn new(event_name: impl Into<String>, source_service: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            correlation_id: None,
            event_name: event_name.into(),
            schema_version: CURRENT_SCHEMA_VERSION,
            source_service: source_service.into(),
        }
    }

    fn default_schema_version() -> u16 {
        CURRENT_SCHEMA_VERSION
    }

    /// Wire field names reserved for the envelope itself.
    pub const RESERVED_FIELDS: [&'static str; 6] = [
        "id",
        "createdAt",
        "correlationId",
        "eventName",
        "schemaVersion",
        "sourceService",
    ];
}

/// A published fact: envelope metadata plus the variant payload.
///
/// On the wire this is one flat camelCase JSON document; metadata fields are
/// always present and payload fields are merged at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope metadata.
    #[serde(flatten)]
    pub meta: EventMetadata,

    /// Variant-specific payload fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Fresh-publish constructor: generates `id` and `created_at`, captures
    /// the event descriptor, and serializes the payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload does not serialize to a JSON object, or when
    /// a payload field collides with a reserved envelope field.
    pub fn publish<E: IntegrationEvent>(
        event: &E,
        source_service: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let value = serde_json::to_value(event).map_err(|source| {
            EnvelopeError::PayloadSerialize {
                event_name: E::NAME,
                source,
            }
        })?;

        let Value::Object(payload) = value else {
            return Err(EnvelopeError::NonObjectPayload { event_name: E::NAME });
        };

        if let Some(field) = payload
            .keys()
            .find(|key| EventMetadata::RESERVED_FIELDS.contains(&key.as_str()))
        {
            return Err(EnvelopeError::ReservedField {
                event_name: E::NAME,
                field: field.clone(),
            });
        }

        Ok(Self {
            meta: EventMetadata::new(E::NAME, source_service),
            payload,
        })
    }

    /// Wire-deserialization constructor: identity fields are preserved
    /// verbatim, never regenerated.
    ///
    /// # Errors
    ///
    /// Fails when the body is not a well-formed envelope document.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|source| EnvelopeError::MalformedBody { source })
    }

    /// Serialize to the flat JSON wire form.
    ///
    /// # Errors
    ///
    /// Fails only on a non-serializable payload value, which the
    /// constructors rule out.
    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|source| EnvelopeError::MalformedBody { source })
    }

    /// Attach a correlation id linking this event to the flow it belongs to.
    #[must_use]
    pub fn correlated_with(mut self, correlation_id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(correlation_id.into());
        self
    }

    /// Copy with fresh identity (`id`, `created_at`); every other field is
    /// unchanged.
    ///
    /// This is the supported path for deliberate re-publication or replay,
    /// keeping the original event's identity intact.
    #[must_use]
    pub fn with_new_id(&self) -> Self {
        Self {
            meta: EventMetadata {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                ..self.meta.clone()
            },
            payload: self.payload.clone(),
        }
    }

    /// Decode the payload into a concrete event type.
    ///
    /// # Errors
    ///
    /// Fails when the payload fields do not match the target type.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, EnvelopeError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|source| {
            EnvelopeError::PayloadDecode {
                event_name: self.meta.event_name.clone(),
                target: E::NAME,
                source,
            }
        })
    }
}
