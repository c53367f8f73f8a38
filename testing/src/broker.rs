//! In-memory broker: a scripted intent source and a recording publisher.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use deliverygo_core::broker::{
    BrokerError, DeliveryNotification, Disposition, InboundMessage, IntentSource,
    IntentSubscription, MessageHandler, NotificationPublisher,
};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct SourceInner {
    pending: VecDeque<InboundMessage>,
    acked: Vec<InboundMessage>,
    next_offset: i64,
    redeliveries: usize,
    connects: usize,
    failing_connects: usize,
}

/// Intent source backed by an in-memory queue.
///
/// Messages are handed out in order. A [`Disposition::Retry`] puts the message
/// back at the head of the queue; [`Disposition::Ack`] records it as committed.
/// A subscription ends cleanly once the queue is empty.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIntentSource {
    inner: Arc<Mutex<SourceInner>>,
}

impl InMemoryIntentSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a JSON body on `topic`.
    pub fn push(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.next_offset;
        inner.next_offset += 1;
        inner.pending.push_back(InboundMessage {
            topic: topic.to_string(),
            key: None,
            payload: payload.into(),
            partition: 0,
            offset,
        });
    }

    /// Messages committed so far, in commit order.
    #[must_use]
    pub fn acked(&self) -> Vec<InboundMessage> {
        self.inner.lock().unwrap().acked.clone()
    }

    /// Messages not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// How many times a message was handed out again after a retry.
    #[must_use]
    pub fn redeliveries(&self) -> usize {
        self.inner.lock().unwrap().redeliveries
    }

    /// Connection attempts so far, failed ones included.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().unwrap().failing_connects = count;
    }
}

impl IntentSource for InMemoryIntentSource {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn IntentSubscription>, BrokerError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.connects += 1;
            if inner.failing_connects > 0 {
                inner.failing_connects -= 1;
                return Err(BrokerError::Connection("injected connection failure".to_string()));
            }
            Ok(Box::new(InMemorySubscription {
                inner: Arc::clone(&self.inner),
            }) as Box<dyn IntentSubscription>)
        })
    }
}

struct InMemorySubscription {
    inner: Arc<Mutex<SourceInner>>,
}

impl IntentSubscription for InMemorySubscription {
    fn run(self: Box<Self>, handler: Arc<dyn MessageHandler>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            loop {
                let next = self.inner.lock().unwrap().pending.pop_front();
                let Some(message) = next else {
                    return Ok(());
                };
                match handler.handle(message.clone()).await {
                    Disposition::Ack => self.inner.lock().unwrap().acked.push(message),
                    Disposition::Retry => {
                        let mut inner = self.inner.lock().unwrap();
                        inner.redeliveries += 1;
                        inner.pending.push_front(message);
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    published: Vec<DeliveryNotification>,
    failing: usize,
}

/// Records published notifications instead of sending them.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPublisher {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryPublisher {
    /// Create a publisher with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<DeliveryNotification> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().unwrap().failing = count;
    }
}

impl NotificationPublisher for InMemoryPublisher {
    fn publish(&self, notification: DeliveryNotification) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing > 0 {
                inner.failing -= 1;
                return Err(BrokerError::Publish {
                    topic: "in-memory".to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }
            inner.published.push(notification);
            Ok(())
        })
    }
}
