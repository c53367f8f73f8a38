//! Structural validation of delivery events.
//!
//! [`validate`] checks an in-memory [`DeliveryEvent`]; the payload enum already
//! makes type/status mismatches unrepresentable, so only the content rules are
//! left. [`decode`] checks a flat [`EventRecord`] read back from storage, where
//! every rule applies.
//!
//! Both are fail-fast: the first violation is returned and nothing else is
//! inspected.

use crate::event::{DeliveryEvent, EventPayload, EventRecord, StoredEvent};
use crate::status::{DeliveryStatus, EventType, UnknownVariant};
use crate::stream::{DeliveryId, OrderId, Version};
use thiserror::Error;

/// A malformed event. Never retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct SchemaError {
    /// Offending field, by its wire name.
    pub field: &'static str,
    /// What is wrong with it.
    pub reason: String,
}

impl SchemaError {
    /// Build a schema error for `field`.
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

fn require_non_blank(field: &'static str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError::new(field, "must not be empty"));
    }
    Ok(())
}

fn validate_payload(payload: &EventPayload) -> Result<(), SchemaError> {
    match payload {
        EventPayload::Confirm { user_id } => require_non_blank("payload.userId", user_id),
        EventPayload::Cancel { actor_user_id }
        | EventPayload::OnTheGo { actor_user_id }
        | EventPayload::Delivered { actor_user_id } => {
            require_non_blank("payload.actorUserId", actor_user_id)
        }
    }
}

/// Validate an event before it is appended.
///
/// # Errors
///
/// Returns the first [`SchemaError`] found: blank `deliveryId`, blank `orderId`,
/// or a blank user id in the payload.
pub fn validate(event: &DeliveryEvent) -> Result<(), SchemaError> {
    require_non_blank("deliveryId", event.delivery_id.as_str())?;
    require_non_blank("orderId", event.order_id.as_str())?;
    validate_payload(&event.payload)
}

/// Decode and validate a persisted record.
///
/// Checks, in order: identifiers, status membership, type membership, the
/// type/status pairing, the payload variant against the type, payload content,
/// and the stream position.
///
/// # Errors
///
/// Returns the first [`SchemaError`] found.
pub fn decode(record: &EventRecord) -> Result<StoredEvent, SchemaError> {
    require_non_blank("deliveryId", &record.delivery_id)?;
    require_non_blank("orderId", &record.order_id)?;

    let status: DeliveryStatus = record
        .delivery_status
        .parse()
        .map_err(|e: UnknownVariant| SchemaError::new("resultingStatus", e.to_string()))?;
    let event_type: EventType = record
        .event_type
        .parse()
        .map_err(|e: UnknownVariant| SchemaError::new("type", e.to_string()))?;

    if event_type.resulting_status() != status {
        return Err(SchemaError::new(
            "resultingStatus",
            format!("{event_type} establishes {}, not {status}", event_type.resulting_status()),
        ));
    }

    let payload: EventPayload = serde_json::from_value(record.payload.clone())
        .map_err(|e| SchemaError::new("payload", e.to_string()))?;
    if payload.event_type() != event_type {
        return Err(SchemaError::new(
            "payload",
            format!("{} payload does not match type {event_type}", payload.event_type()),
        ));
    }
    validate_payload(&payload)?;

    let version = u64::try_from(record.version)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| SchemaError::new("version", format!("{} is not a stream position", record.version)))?;

    Ok(StoredEvent {
        sequence: record.sequence,
        version: Version::new(version),
        created_at: record.created_at,
        event: DeliveryEvent {
            id: record.id,
            delivery_id: DeliveryId::new(record.delivery_id.clone()),
            order_id: OrderId::new(record.order_id.clone()),
            payload,
            occurred_at: record.occurred_at,
        },
    })
}
