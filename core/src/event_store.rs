//! Event store abstraction for delivery lifecycles.
//!
//! The store is append-only: events are inserted and read, never updated or
//! deleted. Appends are conditional on the stream's current [`Version`], which
//! is how two writers racing on the same delivery are told apart: the second
//! one receives [`EventStoreError::ConcurrencyConflict`] and must re-read.
//!
//! # Implementations
//!
//! - `PostgresDeliveryEventStore` (in `deliverygo-postgres`): production
//! - `InMemoryEventStore` (in `deliverygo-testing`): fast, deterministic tests
//!
//! # Example
//!
//! ```no_run
//! use deliverygo_core::event_store::{stream_version, DeliveryEventStore, EventStoreError};
//! use deliverygo_core::state_machine;
//! use deliverygo_core::status::EventType;
//! use deliverygo_core::stream::{DeliveryId, OrderId};
//!
//! async fn confirm<S: DeliveryEventStore>(store: &S) -> Result<(), EventStoreError> {
//!     let delivery_id = DeliveryId::new("D1");
//!     let history = store.find_by_delivery_id(delivery_id.clone()).await?;
//!     let expected = stream_version(&history);
//!     if let Ok(event) = state_machine::next_event(
//!         &history,
//!         EventType::ConfirmDelivery,
//!         delivery_id,
//!         OrderId::new("O1"),
//!         "U1",
//!         chrono::Utc::now(),
//!     ) {
//!         store.append(event, expected).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::{DeliveryEvent, StoredEvent};
use crate::status::DeliveryStatus;
use crate::stream::{DeliveryId, OrderId, Version};
use crate::validation::SchemaError;
use futures::future::BoxFuture;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The event failed structural validation and was not stored.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Another writer appended to the stream first.
    #[error("Concurrency conflict on delivery {delivery_id}: expected version {expected}")]
    ConcurrencyConflict {
        /// Stream that was contended.
        delivery_id: DeliveryId,
        /// Version the losing writer expected.
        expected: Version,
    },

    /// A confirmation for an order that already belongs to another delivery.
    #[error("Order {order_id} is already assigned to delivery {delivery_id}")]
    OrderAlreadyAssigned {
        /// The contested order.
        order_id: OrderId,
        /// Delivery that already owns it.
        delivery_id: DeliveryId,
    },

    /// No delivery exists for the order.
    #[error("No delivery found for order {0}")]
    OrderNotFound(OrderId),

    /// Connectivity loss, timeout, constraint failure or any other backend fault.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl EventStoreError {
    /// Whether re-attempting the whole operation can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::ConcurrencyConflict { .. })
    }
}

/// Append-only store of delivery events.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn DeliveryEventStore>`.
pub trait DeliveryEventStore: Send + Sync {
    /// Append one event, provided the delivery's stream is still at `expected`.
    ///
    /// Runs [`crate::validation::validate`] first. Assigns the sequence,
    /// version (`expected.next()`) and insertion time.
    ///
    /// # Errors
    ///
    /// - `Schema`: the event is malformed
    /// - `ConcurrencyConflict`: the stream moved past `expected`
    /// - `OrderAlreadyAssigned`: a confirmation for an order owned by another delivery
    /// - `Storage`: backend failure or timeout
    fn append(
        &self,
        event: DeliveryEvent,
        expected: Version,
    ) -> BoxFuture<'_, Result<StoredEvent, EventStoreError>>;

    /// All events of a delivery, ordered by `(occurred_at, sequence)`.
    ///
    /// An unknown delivery yields an empty vector.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure; `Schema` when a persisted row fails decoding.
    fn find_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>>;

    /// Raw events whose resulting status is `status`, in fold order.
    ///
    /// Not deduplicated by delivery and not a current-state view.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure; `Schema` when a persisted row fails decoding.
    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>>;

    /// Resolve the delivery created for an order.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` when the order has no events; `Storage` on backend failure.
    fn find_delivery_id_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<DeliveryId, EventStoreError>>;

    /// Cheap round-trip used by readiness checks.
    ///
    /// # Errors
    ///
    /// `Storage` when the backend cannot be reached.
    fn ping(&self) -> BoxFuture<'_, Result<(), EventStoreError>>;
}

/// Version a history has reached: the highest stored position.
#[must_use]
pub fn stream_version(history: &[StoredEvent]) -> Version {
    history
        .iter()
        .map(|e| e.version)
        .max()
        .unwrap_or(Version::INITIAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(EventStoreError::Storage("down".into()).is_retryable());
        assert!(
            EventStoreError::ConcurrencyConflict {
                delivery_id: DeliveryId::new("D1"),
                expected: Version::new(1),
            }
            .is_retryable()
        );
        assert!(!EventStoreError::OrderNotFound(OrderId::new("O1")).is_retryable());
        assert!(!EventStoreError::Schema(SchemaError::new("orderId", "must not be empty")).is_retryable());
    }

    #[test]
    fn empty_history_is_at_initial_version() {
        assert_eq!(stream_version(&[]), Version::INITIAL);
    }
}
