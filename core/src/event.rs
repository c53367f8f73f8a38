//! Delivery lifecycle events.
//!
//! A [`DeliveryEvent`] is an immutable fact. Its [`EventPayload`] is a tagged
//! union whose variant *is* the event type, so the type, the resulting status
//! and the payload shape can never disagree in memory. Once appended, the store
//! wraps the event in a [`StoredEvent`] carrying the insertion sequence and the
//! stream position.
//!
//! [`EventRecord`] is the flat column/wire shape used by persistent stores; it
//! is turned back into a typed event by [`crate::validation::decode`], which is
//! where the pairing and membership rules are enforced.

use crate::status::{DeliveryStatus, EventType};
use crate::stream::{DeliveryId, OrderId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Type-specific event data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// Delivery created for the customer `user_id`.
    #[serde(rename = "confirm_delivery")]
    Confirm {
        /// Customer owning the delivery.
        user_id: String,
    },
    /// Delivery cancelled by `actor_user_id`.
    #[serde(rename = "cancelled_delivery")]
    Cancel {
        /// User who cancelled.
        actor_user_id: String,
    },
    /// Delivery dispatched by `actor_user_id`.
    #[serde(rename = "set_onthego_delivery")]
    OnTheGo {
        /// User who dispatched the delivery.
        actor_user_id: String,
    },
    /// Delivery completed by `actor_user_id`.
    #[serde(rename = "set_delivered_delivery")]
    Delivered {
        /// User who marked the delivery as delivered.
        actor_user_id: String,
    },
}

impl EventPayload {
    /// Build the payload variant for `event_type`.
    ///
    /// For confirmations `user_id` is the owning customer; for every other type
    /// it is the acting user.
    #[must_use]
    pub fn for_type(event_type: EventType, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        match event_type {
            EventType::ConfirmDelivery => Self::Confirm { user_id },
            EventType::CancelledDelivery => Self::Cancel {
                actor_user_id: user_id,
            },
            EventType::SetOnTheGoDelivery => Self::OnTheGo {
                actor_user_id: user_id,
            },
            EventType::SetDeliveredDelivery => Self::Delivered {
                actor_user_id: user_id,
            },
        }
    }

    /// The event type this payload belongs to.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Confirm { .. } => EventType::ConfirmDelivery,
            Self::Cancel { .. } => EventType::CancelledDelivery,
            Self::OnTheGo { .. } => EventType::SetOnTheGoDelivery,
            Self::Delivered { .. } => EventType::SetDeliveredDelivery,
        }
    }

    /// The user id carried by the payload (owner for confirmations, actor otherwise).
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Confirm { user_id } => user_id,
            Self::Cancel { actor_user_id }
            | Self::OnTheGo { actor_user_id }
            | Self::Delivered { actor_user_id } => actor_user_id,
        }
    }

    /// The acting user, for payloads that record one.
    #[must_use]
    pub fn actor_user_id(&self) -> Option<&str> {
        match self {
            Self::Confirm { .. } => None,
            Self::Cancel { actor_user_id }
            | Self::OnTheGo { actor_user_id }
            | Self::Delivered { actor_user_id } => Some(actor_user_id),
        }
    }
}

/// An immutable delivery lifecycle fact, before or independent of storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// System-generated unique identifier.
    pub id: Uuid,
    /// Lifecycle this event belongs to.
    pub delivery_id: DeliveryId,
    /// Order that originated the delivery.
    pub order_id: OrderId,
    /// Type-specific data.
    pub payload: EventPayload,
    /// When the event happened; set by the state machine, never by clients.
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryEvent {
    /// Create an event with a fresh identifier.
    #[must_use]
    pub fn new(
        delivery_id: DeliveryId,
        order_id: OrderId,
        payload: EventPayload,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery_id,
            order_id,
            payload,
            occurred_at,
        }
    }

    /// Event type, derived from the payload.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Status this event establishes.
    #[must_use]
    pub const fn resulting_status(&self) -> DeliveryStatus {
        self.payload.event_type().resulting_status()
    }
}

/// An event as persisted by an event store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Store-assigned global insertion sequence. Strictly increasing.
    pub sequence: i64,
    /// Position within the delivery's stream (1-based).
    pub version: Version,
    /// Store-assigned insertion time.
    pub created_at: DateTime<Utc>,
    /// The event itself.
    pub event: DeliveryEvent,
}

impl StoredEvent {
    /// Ordering key used by every fold: `(occurred_at, sequence)`.
    ///
    /// Equal timestamps are resolved by insertion order, so the later append wins.
    #[must_use]
    pub const fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.event.occurred_at, self.sequence)
    }

    /// Compare two stored events in fold order.
    #[must_use]
    pub fn fold_order(a: &Self, b: &Self) -> Ordering {
        a.ordering_key().cmp(&b.ordering_key())
    }

    /// Event type shortcut.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Resulting status shortcut.
    #[must_use]
    pub const fn resulting_status(&self) -> DeliveryStatus {
        self.event.resulting_status()
    }
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} ({}@v{})",
            self.event.event_type(),
            self.sequence,
            self.event.delivery_id,
            self.version
        )
    }
}

/// Sort events into fold order in place.
pub fn sort_for_fold(events: &mut [StoredEvent]) {
    events.sort_by(StoredEvent::fold_order);
}

/// Flat persisted representation of a stored event.
///
/// Columns are untyped strings so that rows written by older or foreign
/// writers can be checked before they are trusted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-assigned global sequence.
    pub sequence: i64,
    /// Event identifier.
    pub id: Uuid,
    /// Delivery identifier column.
    pub delivery_id: String,
    /// Order identifier column.
    pub order_id: String,
    /// Stream position column.
    pub version: i64,
    /// Resulting status column.
    pub delivery_status: String,
    /// Event type column.
    pub event_type: String,
    /// Payload document (`{"type": ..., ...}`).
    pub payload: serde_json::Value,
    /// Occurrence time.
    pub occurred_at: DateTime<Utc>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Flatten a stored event into its record form.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the payload cannot be encoded.
    pub fn from_stored(stored: &StoredEvent) -> Result<Self, serde_json::Error> {
        #[allow(clippy::cast_possible_wrap)]
        let version = stored.version.value() as i64;
        Ok(Self {
            sequence: stored.sequence,
            id: stored.event.id,
            delivery_id: stored.event.delivery_id.as_str().to_string(),
            order_id: stored.event.order_id.as_str().to_string(),
            version,
            delivery_status: stored.resulting_status().as_str().to_string(),
            event_type: stored.event_type().as_str().to_string(),
            payload: serde_json::to_value(&stored.event.payload)?,
            occurred_at: stored.event.occurred_at,
            created_at: stored.created_at,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn stored(sequence: i64, occurred: i64, event_type: EventType) -> StoredEvent {
        StoredEvent {
            sequence,
            version: Version::new(1),
            created_at: at(occurred),
            event: DeliveryEvent::new(
                DeliveryId::new("D1"),
                OrderId::new("O1"),
                EventPayload::for_type(event_type, "U1"),
                at(occurred),
            ),
        }
    }

    #[test]
    fn payload_variant_determines_type_and_status() {
        for event_type in EventType::ALL {
            let payload = EventPayload::for_type(event_type, "U1");
            assert_eq!(payload.event_type(), event_type);
            assert_eq!(payload.user_id(), "U1");
            assert_eq!(payload.actor_user_id().is_some(), event_type.requires_actor());
        }
    }

    #[test]
    fn payload_json_is_tagged_by_type() {
        let json = serde_json::to_value(EventPayload::Cancel {
            actor_user_id: "U9".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "cancelled_delivery", "actor_user_id": "U9"})
        );
    }

    #[test]
    fn fold_order_breaks_timestamp_ties_by_sequence() {
        let mut events = vec![
            stored(7, 10, EventType::CancelledDelivery),
            stored(3, 10, EventType::SetOnTheGoDelivery),
            stored(1, 0, EventType::ConfirmDelivery),
        ];
        sort_for_fold(&mut events);
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 3, 7]);
    }

    #[test]
    fn record_flattening_keeps_wire_names() {
        let record = EventRecord::from_stored(&stored(5, 0, EventType::SetOnTheGoDelivery)).unwrap();
        assert_eq!(record.event_type, "set_onthego_delivery");
        assert_eq!(record.delivery_status, "on_the_go");
        assert_eq!(record.delivery_id, "D1");
        assert_eq!(record.version, 1);
    }
}
