//! Redpanda broker adapter for DeliveryGo.
//!
//! This crate connects the ingestion pipeline to a Kafka-compatible broker
//! (Redpanda, Apache Kafka, MSK, ...) through rdkafka:
//!
//! - [`RedpandaConsumer`] implements [`IntentSource`]: it subscribes to the
//!   lifecycle-intent topics and feeds each message to a [`MessageHandler`].
//! - [`RedpandaPublisher`] implements [`NotificationPublisher`]: it publishes a
//!   JSON [`DeliveryNotification`] after every successful append.
//!
//! # Architecture
//!
//! ```text
//!  create_delivery ─┐
//!  cancel_delivery ─┤     ┌──────────────────┐     ┌─────────────────┐
//!  delivery_on_... ─┼───▶ │ RedpandaConsumer │───▶ │ MessageHandler  │
//!  delivery_deli.. ─┘     └──────────────────┘     │ (pipeline)      │
//!                                                   └────────┬────────┘
//!                                                            │
//!                         ┌───────────────────┐              │
//!  delivery-events ◀───── │ RedpandaPublisher │ ◀────────────┘
//!                         └───────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - An offset is committed only after the handler returned [`Disposition::Ack`]
//! - On [`Disposition::Retry`] the consumer seeks back to the message and
//!   receives it again after `retry_delay`
//! - If the process crashes before commit, the message is redelivered
//! - Notifications are keyed by `deliveryId`, so one delivery's notifications
//!   stay ordered within a partition
//!
//! # Example
//!
//! ```no_run
//! use deliverygo_redpanda::{RedpandaConsumer, RedpandaPublisher};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let consumer = RedpandaConsumer::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("deliverygo")
//!     .topics(["create_delivery", "cancel_delivery"])
//!     .build()?;
//!
//! let publisher = RedpandaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .topic("delivery-events")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use deliverygo_core::broker::{
    BrokerError, DeliveryNotification, Disposition, InboundMessage, IntentSource,
    IntentSubscription, MessageHandler, NotificationPublisher,
};
use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Default producer send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay before a retried message is received again.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Publishes [`DeliveryNotification`]s as JSON.
///
/// # Example
///
/// ```no_run
/// use deliverygo_redpanda::RedpandaPublisher;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = RedpandaPublisher::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .topic("delivery-events")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl RedpandaPublisher {
    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }

    /// Topic notifications are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Builder for a [`RedpandaPublisher`].
#[derive(Default)]
pub struct RedpandaPublisherBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaPublisherBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the notification topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaPublisher`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the brokers or topic are not set,
    /// or the producer cannot be created.
    pub fn build(self) -> Result<RedpandaPublisher, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::Connection("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| BrokerError::Connection("Notification topic not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_SEND_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            acks,
            compression,
            "RedpandaPublisher created"
        );

        Ok(RedpandaPublisher {
            producer,
            topic,
            timeout,
        })
    }
}

impl NotificationPublisher for RedpandaPublisher {
    fn publish(&self, notification: DeliveryNotification) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(&notification)
                .map_err(|e| BrokerError::Serialization(format!("Failed to encode notification: {e}")))?;

            let record = FutureRecord::to(&self.topic)
                .payload(&payload)
                .key(notification.delivery_id.as_str());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    metrics::counter!("redpanda.notifications.published").increment(1);
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        delivery_id = %notification.delivery_id,
                        event_type = %notification.event_type,
                        "Notification published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    metrics::counter!("redpanda.notifications.failed").increment(1);
                    tracing::error!(
                        topic = %self.topic,
                        delivery_id = %notification.delivery_id,
                        error = %kafka_error,
                        "Failed to publish notification"
                    );
                    Err(BrokerError::Publish {
                        topic: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}

/// Consumes lifecycle intents from one or more topics.
///
/// Each [`IntentSource::connect`] creates a fresh rdkafka consumer in the
/// configured group, subscribes, and checks that the cluster answers a
/// metadata request before handing back a subscription.
#[derive(Clone, Debug)]
pub struct RedpandaConsumer {
    brokers: String,
    consumer_group: String,
    topics: Vec<String>,
    auto_offset_reset: String,
    session_timeout: Duration,
    metadata_timeout: Duration,
    retry_delay: Duration,
}

impl RedpandaConsumer {
    /// Create a new builder for configuring the consumer.
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    fn create_consumer(&self) -> Result<StreamConsumer, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Connection(format!("Failed to subscribe to topics: {e}")))?;
        Ok(consumer)
    }
}

/// Builder for a [`RedpandaConsumer`].
#[derive(Default)]
pub struct RedpandaConsumerBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    topics: Vec<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
    retry_delay: Option<Duration>,
}

impl RedpandaConsumerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Instances sharing a group share the partitions between them. When not
    /// set, the group is derived from the sorted topic names.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Add topics to subscribe to.
    #[must_use]
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Set where a new consumer group starts reading: "earliest" or "latest".
    ///
    /// Default: "earliest", so intents published before the first start are
    /// not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how long `connect` waits for cluster metadata.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Set the delay before a message handed back with
    /// [`Disposition::Retry`] is received again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Build the [`RedpandaConsumer`].
    ///
    /// No connection is made until [`IntentSource::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the brokers or topics are missing.
    pub fn build(self) -> Result<RedpandaConsumer, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::Connection("Brokers not configured".to_string()))?;
        if self.topics.is_empty() {
            return Err(BrokerError::Connection("No topics configured".to_string()));
        }

        let consumer_group = self.consumer_group.unwrap_or_else(|| {
            let mut sorted = self.topics.clone();
            sorted.sort();
            format!("deliverygo-{}", sorted.join("-"))
        });

        Ok(RedpandaConsumer {
            brokers,
            consumer_group,
            topics: self.topics,
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            metadata_timeout: self.metadata_timeout.unwrap_or(Duration::from_secs(5)),
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
        })
    }
}

impl IntentSource for RedpandaConsumer {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn IntentSubscription>, BrokerError>> {
        Box::pin(async move {
            let consumer = self.create_consumer()?;
            let metadata_timeout = self.metadata_timeout;

            // Metadata requests block the calling thread.
            let consumer = tokio::task::spawn_blocking(move || {
                consumer
                    .fetch_metadata(None, Timeout::After(metadata_timeout))
                    .map(|_| consumer)
            })
            .await
            .map_err(|e| BrokerError::Connection(format!("Metadata task failed: {e}")))?
            .map_err(|e| BrokerError::Connection(format!("Brokers unreachable: {e}")))?;

            tracing::info!(
                brokers = %self.brokers,
                topics = ?self.topics,
                consumer_group = %self.consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to intent topics"
            );

            Ok(Box::new(RedpandaSubscription {
                consumer,
                retry_delay: self.retry_delay,
                seek_timeout: self.metadata_timeout,
            }) as Box<dyn IntentSubscription>)
        })
    }
}

struct RedpandaSubscription {
    consumer: StreamConsumer,
    retry_delay: Duration,
    seek_timeout: Duration,
}

impl RedpandaSubscription {
    fn commit(&self, message: &InboundMessage) {
        let mut tpl = TopicPartitionList::new();
        let next = Offset::Offset(message.offset + 1);
        if let Err(e) = tpl.add_partition_offset(&message.topic, message.partition, next) {
            tracing::warn!(topic = %message.topic, error = %e, "Invalid commit position");
            return;
        }
        // A lost commit only causes a redelivery, which the pipeline absorbs.
        if let Err(e) = self.consumer.commit(&tpl, CommitMode::Async) {
            tracing::warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to commit offset (message may be redelivered)"
            );
        }
    }

    fn rewind(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.consumer
            .seek(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset),
                Timeout::After(self.seek_timeout),
            )
            .map_err(|e| {
                BrokerError::Offset(format!(
                    "Failed to seek {}[{}] back to {}: {e}",
                    message.topic, message.partition, message.offset
                ))
            })
    }
}

impl IntentSubscription for RedpandaSubscription {
    fn run(self: Box<Self>, handler: Arc<dyn MessageHandler>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            loop {
                let inbound = match self.consumer.recv().await {
                    Ok(message) => InboundMessage {
                        topic: message.topic().to_string(),
                        key: message
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned()),
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        partition: message.partition(),
                        offset: message.offset(),
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to receive message");
                        return Err(BrokerError::Consume(format!("Failed to receive message: {e}")));
                    }
                };

                metrics::counter!("redpanda.messages.received", "topic" => inbound.topic.clone())
                    .increment(1);
                tracing::trace!(
                    topic = %inbound.topic,
                    partition = inbound.partition,
                    offset = inbound.offset,
                    "Received intent"
                );

                match handler.handle(inbound.clone()).await {
                    Disposition::Ack => self.commit(&inbound),
                    Disposition::Retry => {
                        metrics::counter!("redpanda.messages.retried").increment(1);
                        tracing::warn!(
                            topic = %inbound.topic,
                            partition = inbound.partition,
                            offset = inbound.offset,
                            retry_delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                            "Intent not processed, redelivering"
                        );
                        self.rewind(&inbound)?;
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        })
    }
}
