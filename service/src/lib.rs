//! # DeliveryGo Service
//!
//! Process-level pieces of the delivery engine: configuration, telemetry and
//! the health and metrics HTTP endpoints. The `deliverygo` binary wires them
//! to the Postgres stores, the Redpanda consumer and the ingestion pipeline.

pub mod config;
pub mod http;
pub mod telemetry;

pub use config::{Config, ConfigError, LogFormat};
