//! Publishing side of the bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use super::events::{LifecycleEvent, LIFECYCLE_ROUTING_KEYS};
use super::{Broker, BusError, Event};
use crate::config::MasterConfig;
use crate::retry::BackoffConfig;

/// Publish retry policy
#[derive(Debug, Clone, Copy)]
pub struct PublishPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Bound on each publish-confirm round trip
    pub attempt_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl PublishPolicy {
    pub fn from_master(config: &MasterConfig) -> Self {
        Self {
            retries: config.broker.publish_retries,
            attempt_timeout: config.timeouts.broker_publish(),
            backoff: config.broker.publish_backoff,
        }
    }
}

/// Publisher with confirm, retry and call-order preservation.
pub struct MessageBus {
    broker: Arc<dyn Broker>,
    policy: PublishPolicy,
    publish_lock: Mutex<()>,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn Broker>, policy: PublishPolicy) -> Self {
        Self {
            broker,
            policy,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Publish `payload` under `routing_key`, returning the confirmed event.
    pub async fn publish(&self, routing_key: &str, payload: Value) -> Result<Event, BusError> {
        self.publish_event(Event::new(routing_key, payload)).await
    }

    /// Publish a prepared event.
    ///
    /// Each attempt is bounded by the policy timeout. The same event (same
    /// id) is resent on retry, so a late confirm followed by a resend shows
    /// up as a duplicate the consumer can drop.
    pub async fn publish_event(&self, event: Event) -> Result<Event, BusError> {
        let _ordered = self.publish_lock.lock().await;

        let attempts = self.policy.retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.attempt_timeout, self.broker.publish(&event)).await {
                Ok(Ok(())) => {
                    if attempt > 1 {
                        tracing::info!(
                            routing_key = %event.routing_key,
                            event_id = %event.id,
                            attempt,
                            "publish confirmed after retry"
                        );
                    }
                    return Ok(event);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "confirm timed out after {}ms",
                        self.policy.attempt_timeout.as_millis()
                    )
                }
            }

            if attempt < attempts {
                let delay = self.policy.backoff.delay(attempt);
                tracing::warn!(
                    routing_key = %event.routing_key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(
            routing_key = %event.routing_key,
            attempts,
            error = %last_error,
            "publish failed, broker unavailable"
        );
        Err(BusError::BrokerUnavailable {
            attempts,
            last_error,
        })
    }

    /// Publish a lifecycle event to every lifecycle routing key.
    pub async fn publish_lifecycle(
        &self,
        kind: LifecycleEvent,
        repository_id: &str,
        body: Value,
    ) -> Result<Vec<Event>, BusError> {
        let payload = kind.payload(repository_id, body);
        let mut published = Vec::with_capacity(LIFECYCLE_ROUTING_KEYS.len());
        for routing_key in LIFECYCLE_ROUTING_KEYS {
            published.push(self.publish(routing_key, payload.clone()).await?);
        }
        tracing::debug!(event_type = %kind, repository_id, "lifecycle event published");
        Ok(published)
    }
}
