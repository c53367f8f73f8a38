//! Broker-facing intake: decodes intent messages and routes them through the
//! [`IngestionPipeline`].
//!
//! The topic a message arrives on selects the transition; the JSON body
//! carries the identifiers:
//!
//! ```json
//! { "deliveryId": "D1", "orderId": "O1", "userId": "U9", "correlationId": "c-42" }
//! ```
//!
//! Successes and permanent rejections are acknowledged. Retryable failures
//! are handed back for redelivery.

use crate::pipeline::{IngestionPipeline, LifecycleIntent};
use deliverygo_core::broker::{Disposition, InboundMessage, MessageHandler};
use deliverygo_core::status::EventType;
use deliverygo_core::stream::{DeliveryId, OrderId};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::HashMap;

/// Default topic for each transition.
pub const DEFAULT_TOPICS: [(&str, EventType); 4] = [
    ("create_delivery", EventType::ConfirmDelivery),
    ("cancel_delivery", EventType::CancelledDelivery),
    ("delivery_on_the_go", EventType::SetOnTheGoDelivery),
    ("delivery_delivered", EventType::SetDeliveredDelivery),
];

/// Maps topics to the transition they request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRoutes {
    routes: HashMap<String, EventType>,
}

impl Default for TopicRoutes {
    fn default() -> Self {
        Self::new(DEFAULT_TOPICS.map(|(topic, event_type)| (topic.to_string(), event_type)))
    }
}

impl TopicRoutes {
    /// Build routes from `(topic, transition)` pairs.
    pub fn new(routes: impl IntoIterator<Item = (String, EventType)>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
        }
    }

    /// Transition requested by messages on `topic`.
    #[must_use]
    pub fn transition_for(&self, topic: &str) -> Option<EventType> {
        self.routes.get(topic).copied()
    }

    /// Every routed topic, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentBody {
    delivery_id: Option<String>,
    order_id: Option<String>,
    #[serde(default)]
    user_id: String,
    correlation_id: Option<String>,
}

impl IntentBody {
    fn into_intent(self, transition: EventType) -> LifecycleIntent {
        LifecycleIntent {
            delivery_id: self.delivery_id.map(DeliveryId::new),
            order_id: self.order_id.map(OrderId::new),
            user_id: self.user_id,
            transition,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// [`MessageHandler`] feeding intents into the pipeline.
#[derive(Clone)]
pub struct IntentHandler {
    pipeline: IngestionPipeline,
    routes: TopicRoutes,
}

impl IntentHandler {
    /// Create a handler routing by `routes`.
    #[must_use]
    pub const fn new(pipeline: IngestionPipeline, routes: TopicRoutes) -> Self {
        Self { pipeline, routes }
    }

    async fn process(&self, message: InboundMessage) -> Disposition {
        let Some(transition) = self.routes.transition_for(&message.topic) else {
            metrics::counter!("ingestion.rejected", "reason" => "unknown_topic").increment(1);
            tracing::warn!(topic = %message.topic, offset = message.offset, "Message on unrouted topic dropped");
            return Disposition::Ack;
        };

        let body: IntentBody = match serde_json::from_slice(&message.payload) {
            Ok(body) => body,
            Err(e) => {
                metrics::counter!("ingestion.rejected", "reason" => "undecodable").increment(1);
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable intent dropped"
                );
                return Disposition::Ack;
            }
        };

        let intent = body.into_intent(transition);
        let correlation_id = intent.correlation_id.clone();
        match self.pipeline.ingest(intent).await {
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Intent failed transiently, leaving it for redelivery"
                );
                Disposition::Retry
            }
            Err(e) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    reason = e.kind(),
                    detail = %e.public_message(),
                    "Intent rejected"
                );
                Disposition::Ack
            }
        }
    }
}

impl MessageHandler for IntentHandler {
    fn handle(&self, message: InboundMessage) -> BoxFuture<'_, Disposition> {
        Box::pin(self.process(message))
    }
}
