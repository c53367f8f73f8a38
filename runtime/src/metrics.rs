//! Prometheus metrics for the delivery engine.
//!
//! Components record through the `metrics` facade; [`MetricsServer`] installs
//! the Prometheus recorder and renders the scrape body served by the service's
//! `/metrics` route.
//!
//! # Example
//!
//! ```rust,no_run
//! use deliverygo_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder and renderer.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Event store
    describe_counter!("delivery_store.appends", "Events appended, by event type");
    describe_counter!(
        "delivery_store.append.conflicts",
        "Appends rejected because the stream moved past the expected version"
    );
    describe_counter!(
        "delivery_store.append.order_conflicts",
        "Confirmations rejected because the order already has a delivery"
    );
    describe_counter!("delivery_store.operation.timeouts", "Store round-trips that timed out");
    describe_histogram!(
        "delivery_store.operation.duration_seconds",
        "Time taken by event store round-trips"
    );

    // Projections
    describe_counter!("delivery_projection.applies", "Incremental projection updates");
    describe_counter!(
        "delivery_projection.applies.skipped",
        "Applies of events already folded into the projection"
    );
    describe_counter!("delivery_projection.rebuilds", "Projections rebuilt from the event log");
    describe_counter!(
        "delivery_projection.store.timeouts",
        "Projection store round-trips that timed out"
    );

    // Ingestion
    describe_counter!("ingestion.appended", "Intents that appended a new event");
    describe_counter!("ingestion.duplicates", "Redelivered intents answered from history");
    describe_counter!("ingestion.rejected", "Intents that failed, by reason");
    describe_counter!("ingestion.conflict_retries", "Appends retried after losing a race");
    describe_counter!(
        "ingestion.projection_stale",
        "Durable events whose projection apply failed"
    );
    describe_histogram!("ingestion.duration_seconds", "End-to-end intent processing time");

    // Broker
    describe_counter!("redpanda.messages.received", "Intent messages received, by topic");
    describe_counter!("redpanda.messages.retried", "Intent messages handed back for redelivery");
    describe_counter!("redpanda.notifications.published", "Notifications acknowledged by the broker");
    describe_counter!("redpanda.notifications.failed", "Notifications the broker rejected");
    describe_counter!("consumer.connects", "Successful consumer connections");
    describe_counter!("consumer.failures", "Consumer connection or subscription failures");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new();
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new();
        server.start().unwrap();

        metrics::counter!("ingestion.appended", "type" => "confirm_delivery").increment(1);

        // Another test may have installed the recorder first; then there is
        // nothing to render here.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("ingestion_appended"));
        }
    }
}
