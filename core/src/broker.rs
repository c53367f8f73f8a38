//! Message broker boundary.
//!
//! Inbound lifecycle-change intents arrive as [`InboundMessage`]s and are handed
//! to a [`MessageHandler`], which decides whether the message is done with
//! ([`Disposition::Ack`]) or must be delivered again ([`Disposition::Retry`]).
//! Transports acknowledge only after the handler returns, so a crash mid-way
//! leads to redelivery, never to loss.
//!
//! An [`IntentSource`] opens [`IntentSubscription`]s; the runtime supervisor
//! reconnects when a subscription fails.
//!
//! After a successful append the pipeline publishes a [`DeliveryNotification`]
//! through a [`NotificationPublisher`]. Delivery is at-least-once; consumers
//! must tolerate duplicates.
//!
//! # Implementations
//!
//! - `RedpandaConsumer` / `RedpandaPublisher` (in `deliverygo-redpanda`): production
//! - `InMemoryIntentSource` / `InMemoryPublisher` (in `deliverygo-testing`): tests

use crate::event::StoredEvent;
use crate::status::{DeliveryStatus, EventType};
use crate::stream::{DeliveryId, OrderId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur at the broker boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to or configure the broker.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to publish a message.
    #[error("Publish failed for topic '{topic}': {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Underlying failure.
        reason: String,
    },

    /// Failed to subscribe or receive.
    #[error("Consume failed: {0}")]
    Consume(String),

    /// Failed to commit or rewind a consumer position.
    #[error("Offset management failed: {0}")]
    Offset(String),

    /// Failed to encode an outbound message.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Raw inbound message as received from a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic (queue) the message arrived on; selects the transition.
    pub topic: String,
    /// Message key, if any.
    pub key: Option<String>,
    /// Message body.
    pub payload: Vec<u8>,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

/// What the transport should do with a handled message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished (successfully or with a permanent rejection); commit.
    Ack,
    /// Processing failed transiently; leave uncommitted and redeliver.
    Retry,
}

/// Processes inbound messages for a consumer.
pub trait MessageHandler: Send + Sync {
    /// Handle one message and report its disposition.
    fn handle(&self, message: InboundMessage) -> BoxFuture<'_, Disposition>;
}

/// A connected subscription to the intent queues.
pub trait IntentSubscription: Send {
    /// Feed messages to `handler` until the subscription fails or the source
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when receiving or committing fails; the caller
    /// is expected to reconnect.
    fn run(self: Box<Self>, handler: Arc<dyn MessageHandler>) -> BoxFuture<'static, Result<(), BrokerError>>;
}

/// Opens subscriptions to the intent queues.
pub trait IntentSource: Send + Sync {
    /// Connect to the broker and subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] when the broker cannot be reached.
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn IntentSubscription>, BrokerError>>;
}

/// Outbound notification announcing an appended event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryNotification {
    /// Delivery the event belongs to; also the message key.
    pub delivery_id: DeliveryId,
    /// Originating order.
    pub order_id: OrderId,
    /// Status the event established.
    pub status: DeliveryStatus,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
    /// Event identifier, for consumer-side deduplication.
    pub event_id: Uuid,
}

impl DeliveryNotification {
    /// Describe a stored event.
    #[must_use]
    pub fn from_stored(stored: &StoredEvent) -> Self {
        Self {
            delivery_id: stored.event.delivery_id.clone(),
            order_id: stored.event.order_id.clone(),
            status: stored.resulting_status(),
            event_type: stored.event_type(),
            occurred_at: stored.event.occurred_at,
            event_id: stored.event.id,
        }
    }
}

/// Publishes delivery notifications for other services.
pub trait NotificationPublisher: Send + Sync {
    /// Publish one notification, keyed by its delivery id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the broker does not acknowledge the message.
    fn publish(&self, notification: DeliveryNotification) -> BoxFuture<'_, Result<(), BrokerError>>;
}
