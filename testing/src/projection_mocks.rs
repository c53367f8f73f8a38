//! In-memory projection store.
//!
//! Mirrors the Postgres store's conditional upsert: a write only lands when its
//! `last_sequence` is newer than the stored one.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use deliverygo_core::projection::{
    DeliveryProjection, DeliveryProjectionStore, ProjectionError, Result,
};
use deliverygo_core::status::DeliveryStatus;
use deliverygo_core::stream::{DeliveryId, OrderId};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Inner {
    rows: HashMap<DeliveryId, DeliveryProjection>,
    failing_writes: usize,
    writes: usize,
}

/// In-memory projection store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use deliverygo_core::projection::DeliveryProjectionStore;
/// use deliverygo_core::stream::DeliveryId;
/// use deliverygo_testing::InMemoryProjectionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProjectionStore::new();
/// assert!(store.get_by_delivery_id(DeliveryId::new("D1")).await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty in-memory projection store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored projections
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().rows.len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of a stored projection, bypassing the async API.
    #[must_use]
    pub fn snapshot(&self, delivery_id: &DeliveryId) -> Option<DeliveryProjection> {
        self.inner.read().unwrap().rows.get(delivery_id).cloned()
    }

    /// Number of rows actually written by `upsert` or `replace`.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.inner.read().unwrap().writes
    }

    /// Make the next `count` writes fail with a storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.write().unwrap().failing_writes = count;
    }
}

impl Inner {
    fn take_failure(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(ProjectionError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl DeliveryProjectionStore for InMemoryProjectionStore {
    fn get_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>> {
        Box::pin(async move { Ok(self.snapshot(&delivery_id)) })
    }

    fn get_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>> {
        Box::pin(async move {
            Ok(self
                .inner
                .read()
                .unwrap()
                .rows
                .values()
                .find(|p| p.order_id == order_id)
                .cloned())
        })
    }

    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<DeliveryProjection>>> {
        Box::pin(async move {
            let mut rows: Vec<_> = self
                .inner
                .read()
                .unwrap()
                .rows
                .values()
                .filter(|p| p.status == status)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.delivery_id.cmp(&b.delivery_id));
            Ok(rows)
        })
    }

    fn upsert(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.write().unwrap();
            inner.take_failure()?;
            let newer = inner
                .rows
                .get(&projection.delivery_id)
                .is_none_or(|stored| stored.last_sequence < projection.last_sequence);
            if newer {
                inner.rows.insert(projection.delivery_id.clone(), projection);
                inner.writes += 1;
            }
            Ok(newer)
        })
    }

    fn replace(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut inner = self.inner.write().unwrap();
            inner.take_failure()?;
            let current = inner
                .rows
                .get(&projection.delivery_id)
                .is_none_or(|stored| stored.last_sequence <= projection.last_sequence);
            if current {
                inner.rows.insert(projection.delivery_id.clone(), projection);
                inner.writes += 1;
            }
            Ok(current)
        })
    }
}
