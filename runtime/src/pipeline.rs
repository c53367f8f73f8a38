//! Ingestion pipeline: turns a lifecycle-change intent into a durable event.
//!
//! ```text
//! intent ──▶ resolve deliveryId ──▶ read history ──▶ state machine
//!                                                         │
//!               publish ◀── apply projection ◀── append ◀─┘
//! ```
//!
//! The append is the commit point. Once it succeeds the event is never rolled
//! back. A failed projection apply or publish is reported as retryable, and the
//! redelivered intent re-applies and republishes through the duplicate path.

use deliverygo_core::broker::{BrokerError, DeliveryNotification, NotificationPublisher};
use deliverygo_core::environment::Clock;
use deliverygo_core::event::StoredEvent;
use deliverygo_core::event_store::{DeliveryEventStore, EventStoreError, stream_version};
use deliverygo_core::projection::ProjectionError;
use deliverygo_core::state_machine::{self, InvalidTransition};
use deliverygo_core::status::EventType;
use deliverygo_core::stream::{DeliveryId, OrderId};
use deliverygo_core::validation::SchemaError;
use deliverygo_projections::ProjectionBuilder;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::Instrument;

/// Appends attempted per intent: the first try plus one retry after losing a
/// race on the same delivery.
const MAX_APPEND_ATTEMPTS: usize = 2;

/// A request to move a delivery through its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleIntent {
    /// Target delivery. Optional when `order_id` identifies it, or for a
    /// confirmation that creates a new delivery.
    pub delivery_id: Option<DeliveryId>,
    /// Originating order.
    pub order_id: Option<OrderId>,
    /// Authenticated caller: the owner for confirmations, the actor otherwise.
    pub user_id: String,
    /// Requested transition.
    pub transition: EventType,
    /// Request identifier carried on every log line for this intent.
    pub correlation_id: String,
}

/// Successful result of an ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestionOutcome {
    /// A new event was appended.
    Appended(StoredEvent),
    /// The latest event already records this change; nothing was appended.
    AlreadyApplied(StoredEvent),
}

impl IngestionOutcome {
    /// The appended or pre-existing event.
    #[must_use]
    pub const fn event(&self) -> &StoredEvent {
        match self {
            Self::Appended(e) | Self::AlreadyApplied(e) => e,
        }
    }

    /// Whether this call appended the event.
    #[must_use]
    pub const fn is_appended(&self) -> bool {
        matches!(self, Self::Appended(_))
    }
}

/// Why an intent was not ingested.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Malformed intent or event.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The delivery's current state does not allow the transition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// No events exist for the delivery.
    #[error("Delivery {0} not found")]
    DeliveryNotFound(DeliveryId),

    /// No delivery exists for the order.
    #[error("No delivery found for order {0}")]
    OrderNotFound(OrderId),

    /// The order already belongs to another delivery.
    #[error("Order {order_id} is already assigned to delivery {delivery_id}")]
    OrderAlreadyAssigned {
        /// The contested order.
        order_id: OrderId,
        /// Delivery that owns it.
        delivery_id: DeliveryId,
    },

    /// Lost the race for the delivery even after re-reading its history.
    #[error("Concurrent update of delivery {0}")]
    ConcurrencyConflict(DeliveryId),

    /// Store connectivity or timeout.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The event is durable but its projection could not be updated.
    #[error("Projection update failed: {0}")]
    Projection(#[from] ProjectionError),

    /// The event is durable but its notification could not be published.
    #[error("Failed to publish notification: {0}")]
    Publish(#[from] BrokerError),
}

impl From<EventStoreError> for IngestionError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Schema(e) => Self::Schema(e),
            EventStoreError::ConcurrencyConflict { delivery_id, .. } => {
                Self::ConcurrencyConflict(delivery_id)
            }
            EventStoreError::OrderAlreadyAssigned {
                order_id,
                delivery_id,
            } => Self::OrderAlreadyAssigned {
                order_id,
                delivery_id,
            },
            EventStoreError::OrderNotFound(order_id) => Self::OrderNotFound(order_id),
            EventStoreError::Storage(reason) => Self::Storage(reason),
        }
    }
}

impl IngestionError {
    /// Whether redelivering the intent can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::ConcurrencyConflict(_)
                | Self::Projection(_)
                | Self::Publish(_)
        )
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Schema(_) => "schema",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::DeliveryNotFound(_) | Self::OrderNotFound(_) => "not_found",
            Self::OrderAlreadyAssigned { .. } => "order_already_assigned",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Storage(_) => "storage",
            Self::Projection(_) => "projection",
            Self::Publish(_) => "publish",
        }
    }

    /// Text safe to show to the caller.
    ///
    /// Rejections name the offending field or state pair; infrastructure
    /// failures stay generic.
    #[must_use]
    pub fn public_message(&self) -> String {
        if self.is_retryable() {
            "The request could not be processed right now; please retry".to_string()
        } else {
            self.to_string()
        }
    }
}

fn blank(field: &'static str) -> SchemaError {
    SchemaError::new(field, "must not be empty")
}

/// Orchestrates validation, append, projection and notification.
#[derive(Clone)]
pub struct IngestionPipeline {
    events: Arc<dyn DeliveryEventStore>,
    projections: ProjectionBuilder,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
}

impl IngestionPipeline {
    /// Wire a pipeline from its collaborators.
    #[must_use]
    pub fn new(
        events: Arc<dyn DeliveryEventStore>,
        projections: ProjectionBuilder,
        publisher: Arc<dyn NotificationPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            projections,
            publisher,
            clock,
        }
    }

    /// Ingest one intent.
    ///
    /// Redelivered intents whose change is already the latest event return
    /// [`IngestionOutcome::AlreadyApplied`]; the projection is re-applied and
    /// the notification republished.
    ///
    /// # Errors
    ///
    /// The first failure encountered; see [`IngestionError::is_retryable`]
    /// for which ones a redelivery can cure.
    pub async fn ingest(&self, intent: LifecycleIntent) -> Result<IngestionOutcome, IngestionError> {
        let span = tracing::info_span!(
            "ingest",
            correlation_id = %intent.correlation_id,
            transition = %intent.transition,
            delivery_id = tracing::field::Empty,
        );
        let transition = intent.transition;
        let started = Instant::now();

        let result = self.ingest_inner(intent).instrument(span).await;

        metrics::histogram!("ingestion.duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(IngestionOutcome::Appended(_)) => {
                metrics::counter!("ingestion.appended", "type" => transition.as_str()).increment(1);
            }
            Ok(IngestionOutcome::AlreadyApplied(_)) => {
                metrics::counter!("ingestion.duplicates", "type" => transition.as_str()).increment(1);
            }
            Err(e) => {
                metrics::counter!("ingestion.rejected", "reason" => e.kind()).increment(1);
            }
        }
        result
    }

    async fn ingest_inner(&self, intent: LifecycleIntent) -> Result<IngestionOutcome, IngestionError> {
        if intent.user_id.trim().is_empty() {
            let field = if intent.transition.requires_actor() {
                "payload.actorUserId"
            } else {
                "payload.userId"
            };
            return Err(blank(field).into());
        }

        let delivery_id = self.resolve_delivery_id(&intent).await?;
        tracing::Span::current().record("delivery_id", tracing::field::display(&delivery_id));

        let mut attempt = 1;
        loop {
            let history = self.events.find_by_delivery_id(delivery_id.clone()).await?;
            let order_id = Self::resolve_order_id(&intent, &delivery_id, &history)?;

            if let Some(existing) =
                state_machine::already_applied(&history, intent.transition, Some(&order_id))
            {
                tracing::info!(
                    event_id = %existing.event.id,
                    "Change already recorded, treating intent as a redelivery"
                );
                let existing = existing.clone();
                self.after_append(&existing).await?;
                return Ok(IngestionOutcome::AlreadyApplied(existing));
            }

            let event = state_machine::next_event(
                &history,
                intent.transition,
                delivery_id.clone(),
                order_id,
                intent.user_id.clone(),
                self.clock.now(),
            )?;

            match self.events.append(event, stream_version(&history)).await {
                Ok(stored) => {
                    tracing::info!(
                        order_id = %stored.event.order_id,
                        version = %stored.version,
                        status = %stored.resulting_status(),
                        "Event appended"
                    );
                    self.after_append(&stored).await?;
                    return Ok(IngestionOutcome::Appended(stored));
                }
                Err(EventStoreError::ConcurrencyConflict { .. }) if attempt < MAX_APPEND_ATTEMPTS => {
                    metrics::counter!("ingestion.conflict_retries").increment(1);
                    tracing::info!(attempt, "Lost the race for this delivery, re-reading history");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Find the delivery an intent targets.
    ///
    /// A confirmation without a delivery id reuses the delivery already
    /// created for its order, so a redelivered confirmation lands on the same
    /// stream; only an unknown order gets a fresh id.
    async fn resolve_delivery_id(&self, intent: &LifecycleIntent) -> Result<DeliveryId, IngestionError> {
        if let Some(delivery_id) = &intent.delivery_id {
            if delivery_id.is_blank() {
                return Err(blank("deliveryId").into());
            }
            return Ok(delivery_id.clone());
        }

        let Some(order_id) = intent.order_id.as_ref().filter(|o| !o.is_blank()) else {
            return Err(SchemaError::new("deliveryId", "either deliveryId or orderId is required").into());
        };

        match self.events.find_delivery_id_by_order_id(order_id.clone()).await {
            Ok(delivery_id) => Ok(delivery_id),
            Err(EventStoreError::OrderNotFound(_)) if intent.transition == EventType::ConfirmDelivery => {
                let delivery_id = DeliveryId::generate();
                tracing::debug!(order_id = %order_id, delivery_id = %delivery_id, "Assigned new delivery id");
                Ok(delivery_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The order an event for `delivery_id` must carry.
    fn resolve_order_id(
        intent: &LifecycleIntent,
        delivery_id: &DeliveryId,
        history: &[StoredEvent],
    ) -> Result<OrderId, IngestionError> {
        let recorded = state_machine::latest(history).map(|e| e.event.order_id.clone());
        match (&intent.order_id, recorded) {
            (Some(requested), Some(recorded)) if requested != &recorded => Err(SchemaError::new(
                "orderId",
                format!("delivery {delivery_id} belongs to order {recorded}"),
            )
            .into()),
            (_, Some(recorded)) => Ok(recorded),
            (_, None) if intent.transition != EventType::ConfirmDelivery => {
                Err(IngestionError::DeliveryNotFound(delivery_id.clone()))
            }
            (Some(requested), None) if !requested.is_blank() => Ok(requested.clone()),
            (_, None) => Err(blank("orderId").into()),
        }
    }

    /// Apply the projection and publish the notification for a durable event.
    async fn after_append(&self, stored: &StoredEvent) -> Result<(), IngestionError> {
        let delivery_id = &stored.event.delivery_id;
        if let Err(e) = self.projections.apply(delivery_id, stored).await {
            metrics::counter!("ingestion.projection_stale").increment(1);
            tracing::warn!(
                error = %e,
                sequence = stored.sequence,
                "Projection not updated; the intent will be redelivered"
            );
            return Err(IngestionError::Projection(e));
        }

        self.publisher
            .publish(DeliveryNotification::from_stored(stored))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, event_id = %stored.event.id, "Notification not published");
                IngestionError::Publish(e)
            })
    }
}
