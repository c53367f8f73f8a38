//! `PostgreSQL` event store for DeliveryGo.
//!
//! Implements [`DeliveryEventStore`] on a single append-only `delivery_events`
//! table:
//!
//! - `UNIQUE (delivery_id, version)` turns a lost race into a
//!   [`EventStoreError::ConcurrencyConflict`]
//! - a partial unique index on `order_id` for confirmations keeps one delivery
//!   per order
//! - `CHECK` constraints reject any status or type outside the closed sets
//! - a trigger rejects `UPDATE` and `DELETE`
//!
//! Every round-trip is bounded by the configured operation timeout; expiry is
//! reported as a retryable [`EventStoreError::Storage`].
//!
//! # Example
//!
//! ```no_run
//! use deliverygo_postgres::PostgresDeliveryEventStore;
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDeliveryEventStore::connect(
//!         "postgres://localhost/deliverygo",
//!         10,
//!         Duration::from_secs(5),
//!     )
//!     .await?
//!     .with_operation_timeout(Duration::from_secs(2));
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use deliverygo_core::event::{DeliveryEvent, EventRecord, StoredEvent};
use deliverygo_core::event_store::{DeliveryEventStore, EventStoreError};
use deliverygo_core::status::DeliveryStatus;
use deliverygo_core::stream::{DeliveryId, OrderId, Version};
use deliverygo_core::validation;
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Name of the stream/version uniqueness constraint.
const STREAM_VERSION_CONSTRAINT: &str = "delivery_events_stream_version";

/// Name of the one-confirmation-per-order index.
const ORDER_CONFIRMATION_INDEX: &str = "delivery_events_order_confirmation";

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "sequence, id, delivery_id, order_id, version, delivery_status, \
     event_type, payload, occurred_at, created_at";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    id: Uuid,
    delivery_id: String,
    order_id: String,
    version: i64,
    delivery_status: String,
    event_type: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            sequence: row.sequence,
            id: row.id,
            delivery_id: row.delivery_id,
            order_id: row.order_id,
            version: row.version,
            delivery_status: row.delivery_status,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
        }
    }
}

fn decode_rows(rows: Vec<EventRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    rows.into_iter()
        .map(|row| validation::decode(&EventRecord::from(row)).map_err(EventStoreError::from))
        .collect()
}

fn storage(e: &sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(e.to_string())
}

/// `PostgreSQL`-backed delivery event store.
#[derive(Clone)]
pub struct PostgresDeliveryEventStore {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PostgresDeliveryEventStore {
    /// Create a store on an existing pool with the default operation timeout.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Open a connection pool and create a store on it.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the database cannot be reached.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::Storage(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Bound every database round-trip by `timeout`.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Create the `delivery_events` table, indexes and append-only trigger.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        // Projection migrations may share this database.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::Storage(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `query` under the operation timeout, recording its latency.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        query: F,
    ) -> Result<Result<T, sqlx::Error>, EventStoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.operation_timeout, query).await;
        metrics::histogram!("delivery_store.operation.duration_seconds", "operation" => operation)
            .record(start.elapsed().as_secs_f64());

        outcome.map_err(|_| {
            metrics::counter!("delivery_store.operation.timeouts", "operation" => operation)
                .increment(1);
            tracing::warn!(
                operation,
                timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                "Event store operation timed out"
            );
            EventStoreError::Storage(format!(
                "{operation} timed out after {:?}",
                self.operation_timeout
            ))
        })
    }

    async fn owner_of_order(&self, order_id: &OrderId) -> Result<Option<DeliveryId>, EventStoreError> {
        let row: Option<(String,)> = self
            .bounded(
                "find_delivery_id_by_order_id",
                sqlx::query_as(
                    "SELECT delivery_id FROM delivery_events
                     WHERE order_id = $1
                     ORDER BY sequence ASC
                     LIMIT 1",
                )
                .bind(order_id.as_str())
                .fetch_optional(&self.pool),
            )
            .await?
            .map_err(|e| storage(&e))?;
        Ok(row.map(|(id,)| DeliveryId::new(id)))
    }

    async fn append_event(
        &self,
        event: DeliveryEvent,
        expected: Version,
    ) -> Result<StoredEvent, EventStoreError> {
        validation::validate(&event)?;

        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| EventStoreError::Storage(format!("Failed to encode payload: {e}")))?;
        let version = expected.next();
        let (Ok(expected_value), Ok(version_value)) =
            (i64::try_from(expected.value()), i64::try_from(version.value()))
        else {
            return Err(EventStoreError::Storage(format!(
                "version {version} out of range"
            )));
        };

        let inserted: Result<Option<(i64, DateTime<Utc>)>, sqlx::Error> = self
            .bounded(
                "append",
                sqlx::query_as(
                    r"
                    INSERT INTO delivery_events (
                        id, delivery_id, order_id, version, delivery_status,
                        event_type, payload, occurred_at
                    )
                    SELECT $1, $2, $3, $4, $5, $6, $7, $8
                    WHERE (
                        SELECT COALESCE(MAX(version), 0)
                        FROM delivery_events
                        WHERE delivery_id = $2
                    ) = $9
                    RETURNING sequence, created_at
                    ",
                )
                .bind(event.id)
                .bind(event.delivery_id.as_str())
                .bind(event.order_id.as_str())
                .bind(version_value)
                .bind(event.resulting_status().as_str())
                .bind(event.event_type().as_str())
                .bind(&payload)
                .bind(event.occurred_at)
                .bind(expected_value)
                .fetch_optional(&self.pool),
            )
            .await?;

        let conflict = || {
            metrics::counter!("delivery_store.append.conflicts").increment(1);
            tracing::debug!(
                delivery_id = %event.delivery_id,
                expected = %expected,
                "Append lost a concurrent write"
            );
            EventStoreError::ConcurrencyConflict {
                delivery_id: event.delivery_id.clone(),
                expected,
            }
        };

        let (sequence, created_at) = match inserted {
            Ok(Some(row)) => row,
            Ok(None) => return Err(conflict()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(STREAM_VERSION_CONSTRAINT) => {
                return Err(conflict());
            }
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(ORDER_CONFIRMATION_INDEX) => {
                let owner = self
                    .owner_of_order(&event.order_id)
                    .await?
                    .ok_or_else(|| EventStoreError::Storage(db.to_string()))?;
                metrics::counter!("delivery_store.append.order_conflicts").increment(1);
                return Err(EventStoreError::OrderAlreadyAssigned {
                    order_id: event.order_id.clone(),
                    delivery_id: owner,
                });
            }
            Err(e) => {
                tracing::error!(
                    delivery_id = %event.delivery_id,
                    error = %e,
                    "Failed to append event"
                );
                return Err(storage(&e));
            }
        };

        metrics::counter!("delivery_store.appends", "event_type" => event.event_type().as_str())
            .increment(1);
        tracing::debug!(
            delivery_id = %event.delivery_id,
            event_type = %event.event_type(),
            sequence,
            version = %version,
            "Event appended"
        );

        Ok(StoredEvent {
            sequence,
            version,
            created_at,
            event,
        })
    }
}

impl DeliveryEventStore for PostgresDeliveryEventStore {
    fn append(
        &self,
        event: DeliveryEvent,
        expected: Version,
    ) -> BoxFuture<'_, Result<StoredEvent, EventStoreError>> {
        Box::pin(self.append_event(event, expected))
    }

    fn find_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM delivery_events
                 WHERE delivery_id = $1
                 ORDER BY occurred_at ASC, sequence ASC"
            );
            let rows = self
                .bounded(
                    "find_by_delivery_id",
                    sqlx::query_as::<_, EventRow>(&query)
                        .bind(delivery_id.as_str())
                        .fetch_all(&self.pool),
                )
                .await?
                .map_err(|e| storage(&e))?;
            decode_rows(rows)
        })
    }

    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM delivery_events
                 WHERE delivery_status = $1
                 ORDER BY occurred_at ASC, sequence ASC"
            );
            let rows = self
                .bounded(
                    "find_by_status",
                    sqlx::query_as::<_, EventRow>(&query)
                        .bind(status.as_str())
                        .fetch_all(&self.pool),
                )
                .await?
                .map_err(|e| storage(&e))?;
            decode_rows(rows)
        })
    }

    fn find_delivery_id_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<DeliveryId, EventStoreError>> {
        Box::pin(async move {
            self.owner_of_order(&order_id)
                .await?
                .ok_or(EventStoreError::OrderNotFound(order_id))
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), EventStoreError>> {
        Box::pin(async move {
            self.bounded("ping", sqlx::query("SELECT 1").execute(&self.pool))
                .await?
                .map(|_| ())
                .map_err(|e| storage(&e))
        })
    }
}
