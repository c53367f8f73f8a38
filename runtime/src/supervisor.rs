//! Keeps the intent consumer connected.
//!
//! Each failed connection or subscription counts as one consecutive failure
//! and is followed by a jittered exponential backoff. A successful connection
//! resets the count. When the count reaches the policy's `max_retries` the
//! supervisor stops and marks the consumer [`ConsumerState::Failed`], which
//! takes the service out of readiness.

use crate::health::{ConsumerState, HealthState};
use crate::retry::RetryPolicy;
use deliverygo_core::broker::{BrokerError, IntentSource, MessageHandler};
use std::sync::Arc;
use thiserror::Error;

/// The supervisor gave up.
#[derive(Debug, Error)]
#[error("Consumer gave up after {failures} consecutive failures: {last}")]
pub struct SupervisorError {
    /// Consecutive failures observed.
    pub failures: usize,
    /// The final failure.
    pub last: BrokerError,
}

/// Reconnect loop around an [`IntentSource`].
pub struct ConsumerSupervisor {
    source: Arc<dyn IntentSource>,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    health: HealthState,
}

impl ConsumerSupervisor {
    /// Supervise `source`, feeding messages to `handler`.
    ///
    /// `policy.max_retries` is the number of consecutive failures tolerated.
    #[must_use]
    pub fn new(
        source: Arc<dyn IntentSource>,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        health: HealthState,
    ) -> Self {
        Self {
            source,
            handler,
            policy,
            health,
        }
    }

    /// Consume until the source is exhausted or the failure ceiling is hit.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] after `max_retries` consecutive failures.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut failures = 0;

        loop {
            let outcome = match self.source.connect().await {
                Ok(subscription) => {
                    if failures > 0 {
                        tracing::info!(failures, "Consumer reconnected");
                    }
                    failures = 0;
                    self.health.set_consumer(ConsumerState::Connected);
                    metrics::counter!("consumer.connects").increment(1);
                    subscription.run(Arc::clone(&self.handler)).await
                }
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(()) => {
                    tracing::info!("Intent source exhausted, consumer stopping");
                    return Ok(());
                }
                Err(error) => error,
            };

            failures += 1;
            metrics::counter!("consumer.failures").increment(1);

            if !self.policy.should_retry(failures) {
                self.health.set_consumer(ConsumerState::Failed);
                tracing::error!(failures, error = %error, "Consumer giving up");
                return Err(SupervisorError {
                    failures,
                    last: error,
                });
            }

            self.health.set_consumer(ConsumerState::Reconnecting);
            let delay = self.policy.delay_for_attempt(failures - 1);
            tracing::warn!(
                failures,
                max_failures = self.policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Consumer connection failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
