//! In-memory delivery event store.
//!
//! Enforces the same rules as the Postgres store (validation, conditional
//! append on the expected version, one delivery per order) so pipeline tests
//! exercise real conflict paths. Failure injection covers the rest:
//! [`InMemoryEventStore::set_unavailable`], [`InMemoryEventStore::fail_next_appends`]
//! and [`InMemoryEventStore::race_next_append`]. [`GatedEventStore`] parks
//! history reads so tests can interleave concurrent writers deterministically.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::Utc;
use deliverygo_core::event::{DeliveryEvent, StoredEvent, sort_for_fold};
use deliverygo_core::event_store::{DeliveryEventStore, EventStoreError, stream_version};
use deliverygo_core::status::{DeliveryStatus, EventType};
use deliverygo_core::stream::{DeliveryId, OrderId, Version};
use deliverygo_core::validation;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct Inner {
    events: Vec<StoredEvent>,
    next_sequence: i64,
    unavailable: bool,
    failing_appends: usize,
    racer: Option<DeliveryEvent>,
    append_attempts: usize,
}

impl Inner {
    fn stream(&self, delivery_id: &DeliveryId) -> Vec<StoredEvent> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .filter(|e| &e.event.delivery_id == delivery_id)
            .cloned()
            .collect();
        sort_for_fold(&mut events);
        events
    }

    fn owner_of(&self, order_id: &OrderId) -> Option<DeliveryId> {
        self.events
            .iter()
            .filter(|e| &e.event.order_id == order_id)
            .min_by_key(|e| e.sequence)
            .map(|e| e.event.delivery_id.clone())
    }

    fn insert(&mut self, event: DeliveryEvent, expected: Version) -> Result<StoredEvent, EventStoreError> {
        validation::validate(&event)?;

        if stream_version(&self.stream(&event.delivery_id)) != expected {
            return Err(EventStoreError::ConcurrencyConflict {
                delivery_id: event.delivery_id,
                expected,
            });
        }

        if event.event_type() == EventType::ConfirmDelivery {
            let owner = self
                .events
                .iter()
                .find(|e| {
                    e.event_type() == EventType::ConfirmDelivery && e.event.order_id == event.order_id
                })
                .map(|e| e.event.delivery_id.clone());
            if let Some(delivery_id) = owner {
                return Err(EventStoreError::OrderAlreadyAssigned {
                    order_id: event.order_id,
                    delivery_id,
                });
            }
        }

        self.next_sequence += 1;
        let stored = StoredEvent {
            sequence: self.next_sequence,
            version: expected.next(),
            created_at: Utc::now(),
            event,
        };
        self.events.push(stored.clone());
        Ok(stored)
    }

    fn check_available(&self) -> Result<(), EventStoreError> {
        if self.unavailable {
            return Err(EventStoreError::Storage("event store unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory event store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use deliverygo_core::event::{DeliveryEvent, EventPayload};
/// use deliverygo_core::event_store::DeliveryEventStore;
/// use deliverygo_core::status::EventType;
/// use deliverygo_core::stream::{DeliveryId, OrderId, Version};
/// use deliverygo_testing::InMemoryEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let event = DeliveryEvent::new(
///     DeliveryId::new("D1"),
///     OrderId::new("O1"),
///     EventPayload::for_type(EventType::ConfirmDelivery, "U1"),
///     chrono::Utc::now(),
/// );
/// let stored = store.append(event, Version::INITIAL).await?;
/// assert_eq!(stored.version, Version::new(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event, in insertion order.
    #[must_use]
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    /// Whether nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `append` calls received, successful or not.
    #[must_use]
    pub fn append_attempts(&self) -> usize {
        self.inner.lock().unwrap().append_attempts
    }

    /// Make every operation fail with a storage error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Make the next `count` appends fail with a storage error.
    pub fn fail_next_appends(&self, count: usize) {
        self.inner.lock().unwrap().failing_appends = count;
    }

    /// On the next append, store `event` first at the same expected version,
    /// as if a concurrent writer had won the race.
    pub fn race_next_append(&self, event: DeliveryEvent) {
        self.inner.lock().unwrap().racer = Some(event);
    }
}

impl DeliveryEventStore for InMemoryEventStore {
    fn append(
        &self,
        event: DeliveryEvent,
        expected: Version,
    ) -> BoxFuture<'_, Result<StoredEvent, EventStoreError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.append_attempts += 1;
            inner.check_available()?;
            if inner.failing_appends > 0 {
                inner.failing_appends -= 1;
                return Err(EventStoreError::Storage("injected append failure".to_string()));
            }
            if let Some(racer) = inner.racer.take() {
                inner.insert(racer, expected)?;
            }
            inner.insert(event, expected)
        })
    }

    fn find_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner.check_available()?;
            Ok(inner.stream(&delivery_id))
        })
    }

    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner.check_available()?;
            let mut events: Vec<_> = inner
                .events
                .iter()
                .filter(|e| e.resulting_status() == status)
                .cloned()
                .collect();
            sort_for_fold(&mut events);
            Ok(events)
        })
    }

    fn find_delivery_id_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<DeliveryId, EventStoreError>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            inner.check_available()?;
            inner
                .owner_of(&order_id)
                .ok_or(EventStoreError::OrderNotFound(order_id))
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move { self.inner.lock().unwrap().check_available() })
    }
}

/// Wraps an [`InMemoryEventStore`] and parks history reads after they have
/// read, until the test releases them.
///
/// Only the next `count` reads armed through [`GatedEventStore::park_next_reads`]
/// are parked; later reads pass straight through.
#[derive(Clone, Debug)]
pub struct GatedEventStore {
    inner: InMemoryEventStore,
    gate: Arc<Gate>,
}

#[derive(Debug)]
struct Gate {
    armed: AtomicUsize,
    parked: AtomicUsize,
    permits: Semaphore,
}

impl GatedEventStore {
    /// Wrap `inner` with no reads armed.
    #[must_use]
    pub fn new(inner: InMemoryEventStore) -> Self {
        Self {
            inner,
            gate: Arc::new(Gate {
                armed: AtomicUsize::new(0),
                parked: AtomicUsize::new(0),
                permits: Semaphore::new(0),
            }),
        }
    }

    /// Park the next `count` calls to `find_by_delivery_id`.
    pub fn park_next_reads(&self, count: usize) {
        self.gate.armed.store(count, Ordering::SeqCst);
    }

    /// Reads that have completed and are waiting for release.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.gate.parked.load(Ordering::SeqCst)
    }

    /// Let `count` parked reads return.
    pub fn release(&self, count: usize) {
        self.gate.permits.add_permits(count);
    }

    /// Yield until `count` reads are parked.
    pub async fn wait_for_parked(&self, count: usize) {
        while self.parked() < count {
            tokio::task::yield_now().await;
        }
    }
}

impl DeliveryEventStore for GatedEventStore {
    fn append(
        &self,
        event: DeliveryEvent,
        expected: Version,
    ) -> BoxFuture<'_, Result<StoredEvent, EventStoreError>> {
        self.inner.append(event, expected)
    }

    fn find_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let history = self.inner.find_by_delivery_id(delivery_id).await?;
            let armed = self
                .gate
                .armed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if armed {
                self.gate.parked.fetch_add(1, Ordering::SeqCst);
                if let Ok(permit) = self.gate.permits.acquire().await {
                    permit.forget();
                }
            }
            Ok(history)
        })
    }

    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        self.inner.find_by_status(status)
    }

    fn find_delivery_id_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<DeliveryId, EventStoreError>> {
        self.inner.find_delivery_id_by_order_id(order_id)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        self.inner.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deliverygo_core::event::EventPayload;

    fn event(delivery: &str, order: &str, event_type: EventType) -> DeliveryEvent {
        DeliveryEvent::new(
            DeliveryId::new(delivery),
            OrderId::new(order),
            EventPayload::for_type(event_type, "U1"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conditional_append() {
        let store = InMemoryEventStore::new();
        store
            .append(event("D1", "O1", EventType::ConfirmDelivery), Version::INITIAL)
            .await
            .unwrap();
        let stale = store
            .append(event("D1", "O1", EventType::CancelledDelivery), Version::INITIAL)
            .await;
        assert!(matches!(stale, Err(EventStoreError::ConcurrencyConflict { .. })));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn one_delivery_per_order() {
        let store = InMemoryEventStore::new();
        store
            .append(event("D1", "O1", EventType::ConfirmDelivery), Version::INITIAL)
            .await
            .unwrap();
        let second = store
            .append(event("D2", "O1", EventType::ConfirmDelivery), Version::INITIAL)
            .await;
        assert!(matches!(
            second,
            Err(EventStoreError::OrderAlreadyAssigned { delivery_id, .. }) if delivery_id == DeliveryId::new("D1")
        ));
    }

    #[tokio::test]
    async fn racer_wins_the_next_append() {
        let store = InMemoryEventStore::new();
        store
            .append(event("D1", "O1", EventType::ConfirmDelivery), Version::INITIAL)
            .await
            .unwrap();
        store.race_next_append(event("D1", "O1", EventType::CancelledDelivery));
        let lost = store
            .append(event("D1", "O1", EventType::SetOnTheGoDelivery), Version::new(1))
            .await;
        assert!(matches!(lost, Err(EventStoreError::ConcurrencyConflict { .. })));
        let history = store.find_by_delivery_id(DeliveryId::new("D1")).await.unwrap();
        assert_eq!(history.last().unwrap().event_type(), EventType::CancelledDelivery);
    }

    #[tokio::test]
    async fn status_query_returns_every_matching_event_in_fold_order() {
        let store = InMemoryEventStore::new();
        let base = Utc::now();
        let at = |delivery: &str, order: &str, event_type: EventType, offset: i64| {
            DeliveryEvent::new(
                DeliveryId::new(delivery),
                OrderId::new(order),
                EventPayload::for_type(event_type, "U1"),
                base + chrono::Duration::seconds(offset),
            )
        };
        store
            .append(at("D2", "O2", EventType::ConfirmDelivery, 10), Version::INITIAL)
            .await
            .unwrap();
        store
            .append(at("D1", "O1", EventType::ConfirmDelivery, 0), Version::INITIAL)
            .await
            .unwrap();
        store
            .append(at("D1", "O1", EventType::SetOnTheGoDelivery, 20), Version::new(1))
            .await
            .unwrap();

        let confirmed = store.find_by_status(DeliveryStatus::Confirmed).await.unwrap();
        let ids: Vec<_> = confirmed.iter().map(|e| e.event.delivery_id.as_str()).collect();
        assert_eq!(ids, ["D1", "D2"]);

        let on_the_go = store.find_by_status(DeliveryStatus::OnTheGo).await.unwrap();
        assert_eq!(on_the_go.len(), 1);
        assert!(store.find_by_status(DeliveryStatus::Delivered).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gated_reads_wait_for_release() {
        let store = GatedEventStore::new(InMemoryEventStore::new());
        store
            .append(event("D1", "O1", EventType::ConfirmDelivery), Version::INITIAL)
            .await
            .unwrap();
        store.park_next_reads(1);

        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.find_by_delivery_id(DeliveryId::new("D1")).await })
        };
        store.wait_for_parked(1).await;
        store
            .append(event("D1", "O1", EventType::CancelledDelivery), Version::new(1))
            .await
            .unwrap();
        store.release(1);

        let history = reader.await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(store.find_by_delivery_id(DeliveryId::new("D1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryEventStore::new();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        assert!(
            store
                .find_by_delivery_id(DeliveryId::new("D1"))
                .await
                .unwrap_err()
                .is_retryable()
        );
    }
}
