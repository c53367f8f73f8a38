//! `PostgreSQL` read model for delivery projections.
//!
//! # Architecture
//!
//! ```text
//! Write Side (Event Store)          Read Side (Projections)
//! ┌─────────────────────┐          ┌──────────────────────┐
//! │  PostgreSQL DB #1   │          │  PostgreSQL DB #2    │
//! │                     │   →→→    │                      │
//! │  delivery_events    │  fold    │ delivery_projections │
//! └─────────────────────┘          └──────────────────────┘
//! ```
//!
//! The two sides may share one database; see
//! [`PostgresDeliveryProjectionStore::new_with_separate_db`] for splitting them.

use chrono::{DateTime, Utc};
use deliverygo_core::projection::{
    DeliveryProjection, DeliveryProjectionStore, ProjectionError, Result,
};
use deliverygo_core::status::DeliveryStatus;
use deliverygo_core::stream::{DeliveryId, OrderId};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str =
    "delivery_id, order_id, user_id, status, created_at, last_modified, last_sequence";

#[derive(Debug, sqlx::FromRow)]
struct ProjectionRow {
    delivery_id: String,
    order_id: String,
    user_id: String,
    status: String,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    last_sequence: i64,
}

impl TryFrom<ProjectionRow> for DeliveryProjection {
    type Error = ProjectionError;

    fn try_from(row: ProjectionRow) -> Result<Self> {
        let status = row
            .status
            .parse::<DeliveryStatus>()
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        Ok(Self {
            delivery_id: DeliveryId::new(row.delivery_id),
            order_id: OrderId::new(row.order_id),
            user_id: row.user_id,
            status,
            created_at: row.created_at,
            last_modified: row.last_modified,
            last_sequence: row.last_sequence,
        })
    }
}

/// PostgreSQL-backed store of [`DeliveryProjection`]s.
///
/// ```sql
/// CREATE TABLE delivery_projections (
///     delivery_id   TEXT PRIMARY KEY,
///     order_id      TEXT NOT NULL,
///     user_id       TEXT NOT NULL,
///     status        TEXT NOT NULL,
///     created_at    TIMESTAMPTZ NOT NULL,
///     last_modified TIMESTAMPTZ NOT NULL,
///     last_sequence BIGINT NOT NULL
/// );
/// ```
#[derive(Clone)]
pub struct PostgresDeliveryProjectionStore {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PostgresDeliveryProjectionStore {
    /// Create a projection store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Create a projection store with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn new_with_separate_db(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Bound every database round-trip by `timeout`.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Run database migrations for the projection table.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        // Event store migrations may share this database.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, operation: &'static str, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.operation_timeout, query).await {
            Ok(result) => result.map_err(|e| {
                tracing::error!(operation, error = %e, "Projection store query failed");
                ProjectionError::Storage(format!("Failed to {operation}: {e}"))
            }),
            Err(_) => {
                metrics::counter!("delivery_projection.store.timeouts", "operation" => operation)
                    .increment(1);
                Err(ProjectionError::Storage(format!(
                    "{operation} timed out after {:?}",
                    self.operation_timeout
                )))
            }
        }
    }

    async fn fetch_one_by(&self, column: &'static str, value: &str) -> Result<Option<DeliveryProjection>> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM delivery_projections WHERE {column} = $1 LIMIT 1");
        let row: Option<ProjectionRow> = self
            .bounded(
                "get",
                sqlx::query_as(&query).bind(value).fetch_optional(&self.pool),
            )
            .await?;
        row.map(DeliveryProjection::try_from).transpose()
    }
}

impl DeliveryProjectionStore for PostgresDeliveryProjectionStore {
    fn get_by_delivery_id(
        &self,
        delivery_id: DeliveryId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>> {
        Box::pin(async move { self.fetch_one_by("delivery_id", delivery_id.as_str()).await })
    }

    fn get_by_order_id(
        &self,
        order_id: OrderId,
    ) -> BoxFuture<'_, Result<Option<DeliveryProjection>>> {
        Box::pin(async move { self.fetch_one_by("order_id", order_id.as_str()).await })
    }

    fn list_by_status(
        &self,
        status: DeliveryStatus,
    ) -> BoxFuture<'_, Result<Vec<DeliveryProjection>>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM delivery_projections
                 WHERE status = $1
                 ORDER BY delivery_id"
            );
            let rows: Vec<ProjectionRow> = self
                .bounded(
                    "list",
                    sqlx::query_as(&query).bind(status.as_str()).fetch_all(&self.pool),
                )
                .await?;
            rows.into_iter().map(DeliveryProjection::try_from).collect()
        })
    }

    fn upsert(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = self
                .bounded(
                    "upsert",
                    sqlx::query(
                        "INSERT INTO delivery_projections (
                             delivery_id, order_id, user_id, status,
                             created_at, last_modified, last_sequence
                         )
                         VALUES ($1, $2, $3, $4, $5, $6, $7)
                         ON CONFLICT (delivery_id) DO UPDATE
                         SET status = EXCLUDED.status,
                             last_modified = EXCLUDED.last_modified,
                             last_sequence = EXCLUDED.last_sequence
                         WHERE delivery_projections.last_sequence < EXCLUDED.last_sequence",
                    )
                    .bind(projection.delivery_id.as_str())
                    .bind(projection.order_id.as_str())
                    .bind(&projection.user_id)
                    .bind(projection.status.as_str())
                    .bind(projection.created_at)
                    .bind(projection.last_modified)
                    .bind(projection.last_sequence)
                    .execute(&self.pool),
                )
                .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn replace(&self, projection: DeliveryProjection) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let result = self
                .bounded(
                    "replace",
                    sqlx::query(
                        "INSERT INTO delivery_projections (
                             delivery_id, order_id, user_id, status,
                             created_at, last_modified, last_sequence
                         )
                         VALUES ($1, $2, $3, $4, $5, $6, $7)
                         ON CONFLICT (delivery_id) DO UPDATE
                         SET order_id = EXCLUDED.order_id,
                             user_id = EXCLUDED.user_id,
                             status = EXCLUDED.status,
                             created_at = EXCLUDED.created_at,
                             last_modified = EXCLUDED.last_modified,
                             last_sequence = EXCLUDED.last_sequence
                         WHERE delivery_projections.last_sequence <= EXCLUDED.last_sequence",
                    )
                    .bind(projection.delivery_id.as_str())
                    .bind(projection.order_id.as_str())
                    .bind(&projection.user_id)
                    .bind(projection.status.as_str())
                    .bind(projection.created_at)
                    .bind(projection.last_modified)
                    .bind(projection.last_sequence)
                    .execute(&self.pool),
                )
                .await?;
            Ok(result.rows_affected() == 1)
        })
    }
}
