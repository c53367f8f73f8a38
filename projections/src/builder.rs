//! Projection builder.
//!
//! Folds a delivery's event stream into its [`DeliveryProjection`] and writes
//! it to the read model.
//!
//! - [`ProjectionBuilder::rebuild`] re-reads the full stream and replaces the
//!   stored row, unless an apply has meanwhile written a newer one.
//! - [`ProjectionBuilder::apply`] is the incremental path: one fold step on the
//!   stored row, written with a conditional upsert. Repeated or stale events
//!   leave the row untouched.
//!
//! Both produce the same row for the same stream.

use deliverygo_core::event::StoredEvent;
use deliverygo_core::event_store::DeliveryEventStore;
use deliverygo_core::projection::{
    DeliveryProjection, DeliveryProjectionStore, ProjectionError, Result,
};
use deliverygo_core::stream::{DeliveryId, Version};
use std::sync::Arc;

/// Result of an incremental apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The projection moved forward to include the event.
    Updated(DeliveryProjection),
    /// The event was already folded (or older); the projection is unchanged.
    Unchanged(DeliveryProjection),
}

impl ApplyOutcome {
    /// The projection after the apply, whichever way it went.
    #[must_use]
    pub const fn projection(&self) -> &DeliveryProjection {
        match self {
            Self::Updated(p) | Self::Unchanged(p) => p,
        }
    }

    /// Whether the stored projection changed.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Builds delivery projections from the event store.
#[derive(Clone)]
pub struct ProjectionBuilder {
    events: Arc<dyn DeliveryEventStore>,
    projections: Arc<dyn DeliveryProjectionStore>,
}

impl ProjectionBuilder {
    /// Create a builder reading `events` and writing `projections`.
    #[must_use]
    pub fn new(
        events: Arc<dyn DeliveryEventStore>,
        projections: Arc<dyn DeliveryProjectionStore>,
    ) -> Self {
        Self {
            events,
            projections,
        }
    }

    /// The read model this builder writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeliveryProjectionStore> {
        &self.projections
    }

    /// Fold the full event stream of `delivery_id` and overwrite its projection.
    ///
    /// # Errors
    ///
    /// - `NoEvents` when the delivery has no history
    /// - `EventStore` when the stream cannot be read
    /// - `Storage` when the projection cannot be written
    pub async fn rebuild(&self, delivery_id: &DeliveryId) -> Result<DeliveryProjection> {
        let history = self.events.find_by_delivery_id(delivery_id.clone()).await?;
        let projection = DeliveryProjection::fold(&history)
            .ok_or_else(|| ProjectionError::NoEvents(delivery_id.clone()))?;

        if !self.projections.replace(projection.clone()).await? {
            tracing::debug!(
                delivery_id = %delivery_id,
                last_sequence = projection.last_sequence,
                "Stored projection is newer than the rebuilt one; keeping it"
            );
            let stored = self
                .projections
                .get_by_delivery_id(delivery_id.clone())
                .await?;
            return Ok(stored.unwrap_or(projection));
        }

        metrics::counter!("delivery_projection.rebuilds").increment(1);
        tracing::info!(
            delivery_id = %delivery_id,
            events = history.len(),
            status = %projection.status,
            "Projection rebuilt"
        );
        Ok(projection)
    }

    /// Fold one new event into the stored projection of `delivery_id`.
    ///
    /// With no stored projection the event seeds a new one if it is the first
    /// of its stream; otherwise the stream is rebuilt from the store.
    ///
    /// # Errors
    ///
    /// - `DeliveryMismatch` when `event` belongs to another delivery
    /// - `Storage` / `EventStore` on backend failure
    pub async fn apply(&self, delivery_id: &DeliveryId, event: &StoredEvent) -> Result<ApplyOutcome> {
        if &event.event.delivery_id != delivery_id {
            return Err(ProjectionError::DeliveryMismatch {
                expected: delivery_id.clone(),
                actual: event.event.delivery_id.clone(),
            });
        }

        let current = self
            .projections
            .get_by_delivery_id(delivery_id.clone())
            .await?;

        let candidate = match current {
            Some(mut projection) => {
                if !projection.apply(event) {
                    metrics::counter!("delivery_projection.applies.skipped").increment(1);
                    tracing::debug!(
                        delivery_id = %delivery_id,
                        sequence = event.sequence,
                        last_sequence = projection.last_sequence,
                        "Event already folded into projection"
                    );
                    return Ok(ApplyOutcome::Unchanged(projection));
                }
                projection
            }
            None if event.version == Version::new(1) => DeliveryProjection::from_first(event),
            None => {
                tracing::info!(
                    delivery_id = %delivery_id,
                    version = %event.version,
                    "No projection for a continuing stream, rebuilding"
                );
                return self.rebuild(delivery_id).await.map(ApplyOutcome::Updated);
            }
        };

        if self.projections.upsert(candidate.clone()).await? {
            metrics::counter!("delivery_projection.applies", "status" => candidate.status.as_str())
                .increment(1);
            tracing::debug!(
                delivery_id = %delivery_id,
                event_type = %event.event_type(),
                status = %candidate.status,
                "Projection updated"
            );
            return Ok(ApplyOutcome::Updated(candidate));
        }

        // A concurrent apply wrote a newer row between our read and write.
        let stored = self
            .projections
            .get_by_delivery_id(delivery_id.clone())
            .await?
            .unwrap_or(candidate);
        Ok(ApplyOutcome::Unchanged(stored))
    }

    /// Rebuild several deliveries, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`ProjectionBuilder::rebuild`].
    pub async fn rebuild_all(&self, delivery_ids: &[DeliveryId]) -> Result<Vec<DeliveryProjection>> {
        let mut rebuilt = Vec::with_capacity(delivery_ids.len());
        for delivery_id in delivery_ids {
            rebuilt.push(self.rebuild(delivery_id).await?);
        }
        Ok(rebuilt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use deliverygo_core::event::{DeliveryEvent, EventPayload};
    use deliverygo_core::event_store::stream_version;
    use deliverygo_core::status::{DeliveryStatus, EventType};
    use deliverygo_core::stream::OrderId;
    use deliverygo_testing::{GatedEventStore, InMemoryEventStore, InMemoryProjectionStore, test_clock};
    use deliverygo_core::environment::Clock;

    struct Fixture {
        events: InMemoryEventStore,
        projections: InMemoryProjectionStore,
        builder: ProjectionBuilder,
    }

    fn fixture() -> Fixture {
        let events = InMemoryEventStore::new();
        let projections = InMemoryProjectionStore::new();
        let builder = ProjectionBuilder::new(Arc::new(events.clone()), Arc::new(projections.clone()));
        Fixture {
            events,
            projections,
            builder,
        }
    }

    async fn append(events: &InMemoryEventStore, event_type: EventType, offset: i64) -> StoredEvent {
        let delivery_id = DeliveryId::new("D1");
        let history = events.find_by_delivery_id(delivery_id.clone()).await.unwrap();
        let event = DeliveryEvent::new(
            delivery_id,
            OrderId::new("O1"),
            EventPayload::for_type(event_type, "U1"),
            test_clock().now() + Duration::seconds(offset),
        );
        events.append(event, stream_version(&history)).await.unwrap()
    }

    #[tokio::test]
    async fn apply_then_rebuild_agree() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        for (i, t) in [EventType::ConfirmDelivery, EventType::SetOnTheGoDelivery, EventType::SetDeliveredDelivery]
            .into_iter()
            .enumerate()
        {
            let stored = append(&f.events, t, i64::try_from(i).unwrap()).await;
            assert!(f.builder.apply(&d1, &stored).await.unwrap().is_updated());
        }
        let incremental = f.projections.snapshot(&d1).unwrap();
        let rebuilt = f.builder.rebuild(&d1).await.unwrap();
        assert_eq!(incremental, rebuilt);
        assert_eq!(rebuilt.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn duplicate_apply_changes_nothing() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        let confirm = append(&f.events, EventType::ConfirmDelivery, 0).await;
        let go = append(&f.events, EventType::SetOnTheGoDelivery, 5).await;
        f.builder.apply(&d1, &confirm).await.unwrap();
        f.builder.apply(&d1, &go).await.unwrap();
        let before = f.projections.snapshot(&d1).unwrap();
        let writes = f.projections.writes();

        let again = f.builder.apply(&d1, &go).await.unwrap();
        assert!(!again.is_updated());
        assert_eq!(f.projections.snapshot(&d1).unwrap(), before);
        assert_eq!(f.projections.writes(), writes);
    }

    #[tokio::test]
    async fn stale_apply_does_not_regress() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        let confirm = append(&f.events, EventType::ConfirmDelivery, 0).await;
        let cancel = append(&f.events, EventType::CancelledDelivery, 5).await;
        f.builder.apply(&d1, &confirm).await.unwrap();
        f.builder.apply(&d1, &cancel).await.unwrap();
        f.builder.apply(&d1, &confirm).await.unwrap();
        assert_eq!(f.projections.snapshot(&d1).unwrap().status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_projection_for_later_event_rebuilds() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        append(&f.events, EventType::ConfirmDelivery, 0).await;
        let go = append(&f.events, EventType::SetOnTheGoDelivery, 1).await;

        let outcome = f.builder.apply(&d1, &go).await.unwrap();
        let projection = outcome.projection();
        assert_eq!(projection.status, DeliveryStatus::OnTheGo);
        assert_eq!(projection.user_id, "U1");
        assert_eq!(projection.created_at, test_clock().now());
    }

    #[tokio::test]
    async fn slow_rebuild_keeps_a_newer_apply() {
        let events = InMemoryEventStore::new();
        let gated = GatedEventStore::new(events.clone());
        let projections = InMemoryProjectionStore::new();
        let slow = ProjectionBuilder::new(Arc::new(gated.clone()), Arc::new(projections.clone()));
        let fast = ProjectionBuilder::new(Arc::new(events.clone()), Arc::new(projections.clone()));
        let d1 = DeliveryId::new("D1");
        let confirm = append(&events, EventType::ConfirmDelivery, 0).await;
        fast.apply(&d1, &confirm).await.unwrap();
        let go = append(&events, EventType::SetOnTheGoDelivery, 1).await;
        fast.apply(&d1, &go).await.unwrap();

        // The rebuild reads [confirm, go] and stalls before writing.
        gated.park_next_reads(1);
        let rebuild = tokio::spawn({
            let d1 = d1.clone();
            async move { slow.rebuild(&d1).await }
        });
        gated.wait_for_parked(1).await;

        let delivered = append(&events, EventType::SetDeliveredDelivery, 2).await;
        assert!(fast.apply(&d1, &delivered).await.unwrap().is_updated());
        gated.release(1);

        let returned = rebuild.await.unwrap().unwrap();
        let stored = projections.snapshot(&d1).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.last_sequence, delivered.sequence);
        assert_eq!(returned, stored);
    }

    #[tokio::test]
    async fn rebuild_overwrites_a_row_at_the_same_sequence() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        let confirm = append(&f.events, EventType::ConfirmDelivery, 0).await;
        let mut corrupted = DeliveryProjection::from_first(&confirm);
        corrupted.status = DeliveryStatus::Cancelled;
        f.projections.upsert(corrupted).await.unwrap();

        let rebuilt = f.builder.rebuild(&d1).await.unwrap();
        assert_eq!(rebuilt.status, DeliveryStatus::Confirmed);
        assert_eq!(f.projections.snapshot(&d1).unwrap(), rebuilt);
    }

    #[tokio::test]
    async fn rebuild_of_unknown_delivery_fails() {
        let f = fixture();
        let err = f.builder.rebuild(&DeliveryId::new("nope")).await.unwrap_err();
        assert!(matches!(err, ProjectionError::NoEvents(_)));
    }

    #[tokio::test]
    async fn apply_rejects_foreign_event() {
        let f = fixture();
        let confirm = append(&f.events, EventType::ConfirmDelivery, 0).await;
        let err = f.builder.apply(&DeliveryId::new("D2"), &confirm).await.unwrap_err();
        assert!(matches!(err, ProjectionError::DeliveryMismatch { .. }));
    }

    #[tokio::test]
    async fn failed_write_leaves_projection_stale_until_retry() {
        let f = fixture();
        let d1 = DeliveryId::new("D1");
        let confirm = append(&f.events, EventType::ConfirmDelivery, 0).await;
        f.builder.apply(&d1, &confirm).await.unwrap();
        let go = append(&f.events, EventType::SetOnTheGoDelivery, 1).await;

        f.projections.fail_next_writes(1);
        let err = f.builder.apply(&d1, &go).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.projections.snapshot(&d1).unwrap().status, DeliveryStatus::Confirmed);

        f.builder.apply(&d1, &go).await.unwrap();
        assert_eq!(f.projections.snapshot(&d1).unwrap().status, DeliveryStatus::OnTheGo);
    }
}
