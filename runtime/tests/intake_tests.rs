//! Intake and consumer supervision over the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use deliverygo_core::environment::Clock;
use deliverygo_core::status::DeliveryStatus;
use deliverygo_core::stream::DeliveryId;
use deliverygo_projections::ProjectionBuilder;
use deliverygo_runtime::{
    ConsumerState, ConsumerSupervisor, HealthState, IngestionPipeline, IntentHandler, RetryPolicy,
    TopicRoutes,
};
use deliverygo_testing::{
    InMemoryEventStore, InMemoryIntentSource, InMemoryProjectionStore, InMemoryPublisher,
    TickingClock, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    source: InMemoryIntentSource,
    events: InMemoryEventStore,
    projections: InMemoryProjectionStore,
    health: HealthState,
    handler: Arc<IntentHandler>,
}

fn harness() -> Harness {
    let events = InMemoryEventStore::new();
    let projections = InMemoryProjectionStore::new();
    let builder = ProjectionBuilder::new(Arc::new(events.clone()), Arc::new(projections.clone()));
    let pipeline = IngestionPipeline::new(
        Arc::new(events.clone()),
        builder,
        Arc::new(InMemoryPublisher::new()),
        Arc::new(TickingClock::new(test_clock().now())),
    );
    Harness {
        source: InMemoryIntentSource::new(),
        events,
        projections,
        health: HealthState::new(),
        handler: Arc::new(IntentHandler::new(pipeline, TopicRoutes::default())),
    }
}

fn policy(max_failures: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_failures)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

impl Harness {
    fn supervisor(&self, max_failures: usize) -> ConsumerSupervisor {
        ConsumerSupervisor::new(
            Arc::new(self.source.clone()),
            self.handler.clone(),
            policy(max_failures),
            self.health.clone(),
        )
    }

    fn status(&self, delivery: &str) -> Option<DeliveryStatus> {
        self.projections
            .snapshot(&DeliveryId::new(delivery))
            .map(|p| p.status)
    }
}

#[tokio::test]
async fn lifecycle_flows_from_topics_to_projection() {
    let h = harness();
    h.source.push(
        "create_delivery",
        r#"{"deliveryId":"D1","orderId":"O1","userId":"U1"}"#,
    );
    h.source.push("delivery_on_the_go", r#"{"deliveryId":"D1","userId":"driver"}"#);
    h.source.push("delivery_delivered", r#"{"orderId":"O1","userId":"driver"}"#);

    h.supervisor(3).run().await.unwrap();

    assert_eq!(h.source.acked().len(), 3);
    assert_eq!(h.source.redeliveries(), 0);
    assert_eq!(h.status("D1"), Some(DeliveryStatus::Delivered));
    assert_eq!(h.health.consumer(), ConsumerState::Connected);
}

#[tokio::test]
async fn permanent_rejections_are_acknowledged() {
    let h = harness();
    h.source.push("create_delivery", "not json");
    h.source.push("create_delivery", r#"{"deliveryId":"D1","orderId":"O1","userId":"U1"}"#);
    // Confirmed -> delivered is not a legal transition.
    h.source.push("delivery_delivered", r#"{"deliveryId":"D1","userId":"driver"}"#);
    h.source.push("cancel_delivery", r#"{"deliveryId":"D1"}"#);
    h.source.push("unrouted_topic", r#"{"deliveryId":"D1","userId":"U1"}"#);

    h.supervisor(3).run().await.unwrap();

    assert_eq!(h.source.acked().len(), 5);
    assert_eq!(h.source.redeliveries(), 0);
    assert_eq!(h.events.len(), 1);
    assert_eq!(h.status("D1"), Some(DeliveryStatus::Confirmed));
}

#[tokio::test]
async fn transient_failure_is_redelivered() {
    let h = harness();
    h.events.fail_next_appends(1);
    h.source.push("create_delivery", r#"{"orderId":"O1","userId":"U1"}"#);

    h.supervisor(3).run().await.unwrap();

    assert_eq!(h.source.redeliveries(), 1);
    assert_eq!(h.source.acked().len(), 1);
    assert_eq!(h.events.len(), 1);
}

#[tokio::test]
async fn failed_projection_update_is_redelivered() {
    let h = harness();
    h.source.push("create_delivery", r#"{"deliveryId":"D1","orderId":"O1","userId":"U1"}"#);
    h.source.push("delivery_on_the_go", r#"{"deliveryId":"D1","userId":"driver"}"#);
    h.supervisor(3).run().await.unwrap();

    h.projections.fail_next_writes(1);
    h.source.push("delivery_delivered", r#"{"deliveryId":"D1","userId":"driver"}"#);
    h.supervisor(3).run().await.unwrap();

    assert_eq!(h.source.redeliveries(), 1);
    assert_eq!(h.source.acked().len(), 3);
    assert_eq!(h.events.len(), 3);
    assert_eq!(h.status("D1"), Some(DeliveryStatus::Delivered));
}

#[tokio::test]
async fn reconnects_within_the_ceiling() {
    let h = harness();
    h.source.fail_next_connects(2);
    h.source.push("create_delivery", r#"{"deliveryId":"D1","orderId":"O1","userId":"U1"}"#);

    h.supervisor(3).run().await.unwrap();

    assert_eq!(h.source.connects(), 3);
    assert_eq!(h.source.pending(), 0);
    assert_eq!(h.health.consumer(), ConsumerState::Connected);
}

#[tokio::test]
async fn gives_up_and_reports_unhealthy() {
    let h = harness();
    h.source.fail_next_connects(10);

    let err = h.supervisor(3).run().await.unwrap_err();

    assert_eq!(err.failures, 3);
    assert_eq!(h.source.connects(), 3);
    assert_eq!(h.health.consumer(), ConsumerState::Failed);
}
