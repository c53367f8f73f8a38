//! Delivery projection: the read model folded from a delivery's events.
//!
//! ```text
//! Write Side:                    Read Side:
//! ┌──────────────────┐          ┌──────────────────────┐
//! │ delivery_events  │  fold    │ delivery_projections │
//! │ (append-only)    │ ───────▶ │ (one row / delivery) │
//! └──────────────────┘          └──────────────────────┘
//! ```
//!
//! The projection is a cache. It is always reproducible by folding the event
//! stream from empty state, and every fold step is guarded by the event's
//! `(occurred_at, sequence)` key so a stale or repeated event never moves it
//! backwards.

use crate::event::StoredEvent;
use crate::event_store::EventStoreError;
use crate::status::DeliveryStatus;
use crate::stream::{DeliveryId, OrderId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A persisted projection row could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reading the event stream failed
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// Rebuild was requested for a delivery with no events
    #[error("No events for delivery {0}")]
    NoEvents(DeliveryId),

    /// The event handed to `apply` belongs to another delivery
    #[error("Event for delivery {actual} applied to projection of {expected}")]
    DeliveryMismatch {
        /// Delivery whose projection was targeted.
        expected: DeliveryId,
        /// Delivery the event belongs to.
        actual: DeliveryId,
    },
}

impl ProjectionError {
    /// Whether a later retry can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::EventStore(e) => e.is_retryable(),
            Self::Serialization(_) | Self::NoEvents(_) | Self::DeliveryMismatch { .. } => false,
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Current state of one delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryProjection {
    /// Unique key.
    pub delivery_id: DeliveryId,
    /// Originating order.
    pub order_id: OrderId,
    /// User recorded on the first event (the customer, for a confirmation).
    pub user_id: String,
    /// Status established by the latest folded event.
    pub status: DeliveryStatus,
    /// When the first event occurred.
    pub created_at: DateTime<Utc>,
    /// When the latest folded event occurred.
    pub last_modified: DateTime<Utc>,
    /// Sequence of the latest folded event.
    pub last_sequence: i64,
}

impl DeliveryProjection {
    /// Seed a projection from the first event of a stream.
    #[must_use]
    pub fn from_first(event: &StoredEvent) -> Self {
        Self {
            delivery_id: event.event.delivery_id.clone(),
            order_id: event.event.order_id.clone(),
            user_id: event.event.payload.user_id().to_string(),
            status: event.resulting_status(),
            created_at: event.event.occurred_at,
            last_modified: event.event.occurred_at,
            last_sequence: event.sequence,
        }
    }

    /// Position of the latest folded event, comparable with
    /// [`StoredEvent::ordering_key`].
    #[must_use]
    pub const fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.last_modified, self.last_sequence)
    }

    /// Apply one fold step.
    ///
    /// Returns `false`, leaving the projection untouched, when the event is not
    /// newer than what has already been folded.
    pub fn apply(&mut self, event: &StoredEvent) -> bool {
        if event.ordering_key() <= self.ordering_key() {
            return false;
        }
        self.status = event.resulting_status();
        self.last_modified = event.event.occurred_at;
        self.last_sequence = event.sequence;
        true
    }

    /// Fold a complete history, in any slice order, from empty state.
    ///
    /// Returns `None` for an empty history.
    #[must_use]
    pub fn fold(events: &[StoredEvent]) -> Option<Self> {
        let mut ordered: Vec<&StoredEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.ordering_key());
        let (first, rest) = ordered.split_first()?;
        let mut projection = Self::from_first(first);
        for event in rest {
            projection.apply(event);
        }
        Some(projection)
    }
}

/// Read-optimised storage of [`DeliveryProjection`]s.
///
/// Query methods serve the read boundary; `upsert` and `replace` are used by
/// the projection builder only.
pub trait DeliveryProjectionStore: Send + Sync {
    /// Look up a delivery's projection.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure, `Serialization` on an undecodable row.
    fn get_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>>;

    /// Look up the projection of the delivery created for an order.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure, `Serialization` on an undecodable row.
    fn get_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>>;

    /// Every delivery currently at `status`.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure, `Serialization` on an undecodable row.
    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<DeliveryProjection>>>;

    /// Insert, or update when `projection.last_sequence` is newer than the
    /// stored one. Returns whether a row was written.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    fn upsert(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>>;

    /// Overwrite every column of the stored projection (used by rebuild),
    /// unless the stored row has a newer `last_sequence`. Returns whether a
    /// row was written.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    fn replace(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>>;
}
