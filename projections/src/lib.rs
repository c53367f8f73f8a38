//! Delivery projections for DeliveryGo.
//!
//! # Overview
//!
//! - [`ProjectionBuilder`]: folds event streams into [`DeliveryProjection`]s
//!   (`rebuild` from scratch, `apply` one event incrementally)
//! - [`PostgresDeliveryProjectionStore`]: the `PostgreSQL` read model serving
//!   `get_by_delivery_id`, `get_by_order_id` and `list_by_status`
//!
//! # CQRS Separation
//!
//! Queries are answered from the projection table only, never by folding raw
//! events, so every read is a single indexed lookup:
//!
//! ```text
//! Event Store DB (Write)  →  ProjectionBuilder  →  Projection DB (Read)
//! ```
//!
//! [`DeliveryProjection`]: deliverygo_core::projection::DeliveryProjection

pub mod builder;
pub mod postgres;

// Re-export main types for convenience
pub use builder::{ApplyOutcome, ProjectionBuilder};
pub use postgres::PostgresDeliveryProjectionStore;
