//! # DeliveryGo Runtime
//!
//! Turns broker intents into durable delivery events.
//!
//! ## Core Components
//!
//! - **Pipeline** ([`pipeline::IngestionPipeline`]): resolve, validate, append,
//!   project, notify
//! - **Intake** ([`intake::IntentHandler`]): decodes intent messages and decides
//!   between acknowledging and redelivering them
//! - **Supervisor** ([`supervisor::ConsumerSupervisor`]): reconnects the consumer
//!   with jittered exponential backoff and reports readiness
//! - **Health** ([`health`]) and **Metrics** ([`metrics`])
//!
//! ## Example
//!
//! ```
//! use deliverygo_core::environment::SystemClock;
//! use deliverygo_projections::ProjectionBuilder;
//! use deliverygo_runtime::pipeline::{IngestionPipeline, LifecycleIntent};
//! use deliverygo_core::status::EventType;
//! use deliverygo_core::stream::OrderId;
//! use deliverygo_testing::{InMemoryEventStore, InMemoryProjectionStore, InMemoryPublisher};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let events = Arc::new(InMemoryEventStore::new());
//! let projections = ProjectionBuilder::new(events.clone(), Arc::new(InMemoryProjectionStore::new()));
//! let pipeline = IngestionPipeline::new(
//!     events,
//!     projections,
//!     Arc::new(InMemoryPublisher::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let outcome = pipeline
//!     .ingest(LifecycleIntent {
//!         delivery_id: None,
//!         order_id: Some(OrderId::new("O1")),
//!         user_id: "U1".to_string(),
//!         transition: EventType::ConfirmDelivery,
//!         correlation_id: "c-1".to_string(),
//!     })
//!     .await?;
//! assert!(outcome.is_appended());
//! # Ok(())
//! # }
//! ```

pub mod health;
pub mod intake;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod supervisor;

pub use health::{ConsumerState, HealthState};
pub use intake::{IntentHandler, TopicRoutes};
pub use pipeline::{IngestionError, IngestionOutcome, IngestionPipeline, LifecycleIntent};
pub use retry::RetryPolicy;
pub use supervisor::{ConsumerSupervisor, SupervisorError};
