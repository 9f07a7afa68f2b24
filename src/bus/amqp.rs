//! AMQP 0-9-1 broker.
//!
//! Events are JSON bodies on a durable topic exchange, routed by their
//! routing key. Publishes wait for the publisher confirm. Each consumer gets
//! its own channel; closing it hands unacknowledged deliveries back to the
//! broker.
//!
//! A nack with requeue republishes the event to its queue with `attempts`
//! incremented and then acks the original, so the count survives the trip.
//! If the republish fails the original is nacked back as-is. A release, and
//! anything the broker hands back on its own, keeps the count it had.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;

use super::{Broker, BrokerError, Delivery, DeliveryTag, Event};
use crate::config::BrokerConfig;

const CONSUMER_BUFFER: usize = 64;

/// Unacknowledged deliveries per consumer channel.
const CONSUMER_PREFETCH: u16 = 32;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

type ConsumerId = u64;

struct Pending {
    consumer: ConsumerId,
    acker: Acker,
    event: Event,
}

type PendingMap = Arc<Mutex<HashMap<(String, DeliveryTag), Pending>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<(String, DeliveryTag), Pending>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn unavailable(context: &str, err: lapin::Error) -> BrokerError {
    BrokerError::Unavailable(format!("{}: {}", context, err))
}

fn properties_for(event: &Event) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type("application/json".into())
        .with_message_id(event.id.to_string().into())
}

/// Decode a delivery body. The broker's `redelivered` flag is ignored: a
/// message returned by a closing channel was never handled.
fn decode(data: &[u8]) -> Result<Event, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Acknowledgements on one delivery.
#[async_trait]
trait Settle: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;
    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Settle for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await.map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        Acker::nack(self, options).await.map(|_| ())
    }
}

/// Settle the original of a requeued delivery once its copy with the bumped
/// attempt count has been republished, or hand it back unchanged if that
/// republish failed.
async fn settle_requeue(
    delivery: &dyn Settle,
    queue: &str,
    tag: DeliveryTag,
    republished: Result<(), BrokerError>,
) -> Result<(), BrokerError> {
    match republished {
        Ok(()) => delivery.ack().await.map_err(|e| unavailable("ack requeued", e)),
        Err(e) => {
            tracing::warn!(queue, tag, error = %e, "republish failed, returning message to broker");
            delivery.nack(true).await.map_err(|e| unavailable("nack", e))
        }
    }
}

/// Broker backed by an AMQP server.
pub struct AmqpBroker {
    connection: Connection,
    exchange: String,
    publisher: tokio::sync::Mutex<Option<Channel>>,
    pending: PendingMap,
    next_tag: Arc<AtomicU64>,
    next_consumer: AtomicU64,
}

impl AmqpBroker {
    /// Connect and declare the event exchange.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| unavailable("connect", e))?;
        tracing::info!(
            host = %config.host,
            port = config.port,
            vhost = %config.virtual_host,
            exchange = %config.exchange,
            "connected to broker"
        );

        let broker = Self {
            connection,
            exchange: config.exchange.clone(),
            publisher: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(0)),
            next_consumer: AtomicU64::new(0),
        };

        let channel = broker.open_publisher().await?;
        *broker.publisher.lock().await = Some(channel);
        Ok(broker)
    }

    async fn open_publisher(&self) -> Result<Channel, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| unavailable("open channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| unavailable("enable confirms", e))?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| unavailable("declare exchange", e))?;
        Ok(channel)
    }

    /// Publish through the confirm channel, reopening it after a failure.
    async fn publish_to(&self, exchange: &str, routing_key: &str, event: &Event) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| BrokerError::Unavailable(format!("encode event {}: {}", event.id, e)))?;

        let mut publisher = self.publisher.lock().await;
        let channel = match publisher.as_ref() {
            Some(channel) if channel.status().connected() => channel.clone(),
            _ => {
                let channel = self.open_publisher().await?;
                *publisher = Some(channel.clone());
                channel
            }
        };

        let result = async {
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties_for(event),
                )
                .await?
                .await
        }
        .await;

        match result {
            Ok(confirmation) if confirmation.is_nack() => Err(BrokerError::Unavailable(format!(
                "broker rejected event {}",
                event.id
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                *publisher = None;
                Err(unavailable("publish", e))
            }
        }
    }

    fn take_pending(&self, queue: &str, tag: DeliveryTag) -> Result<Pending, BrokerError> {
        lock(&self.pending)
            .remove(&(queue.to_string(), tag))
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                tag,
            })
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("exchange", &self.exchange)
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

/// Forward deliveries from one consumer channel until either side closes.
async fn pump(
    queue: String,
    consumer_id: ConsumerId,
    channel: Channel,
    mut consumer: lapin::Consumer,
    tx: mpsc::Sender<Delivery>,
    pending: PendingMap,
    next_tag: Arc<AtomicU64>,
) {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => break,
            next = consumer.next() => next,
        };
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                tracing::warn!(queue = %queue, error = %e, "consumer stream failed");
                break;
            }
            None => break,
        };

        let event = match decode(&delivery.data) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "dropping undecodable message");
                let options = BasicRejectOptions { requeue: false };
                if let Err(e) = delivery.acker.reject(options).await {
                    tracing::warn!(queue = %queue, error = %e, "reject failed");
                }
                continue;
            }
        };

        let tag = next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&pending).insert(
            (queue.clone(), tag),
            Pending {
                consumer: consumer_id,
                acker: delivery.acker,
                event: event.clone(),
            },
        );
        if tx.send(Delivery { tag, event }).await.is_err() {
            break;
        }
    }

    // The broker requeues whatever this channel left unacknowledged.
    lock(&pending).retain(|_, p| p.consumer != consumer_id);
    if let Err(e) = channel.close(200, "consumer closed").await {
        tracing::debug!(queue = %queue, error = %e, "closing consumer channel");
    }
    tracing::debug!(queue = %queue, consumer = consumer_id, "consumer closed");
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        self.publish_to(&self.exchange, &event.routing_key, event).await
    }

    async fn bind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| unavailable("open channel", e))?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| unavailable("declare queue", e))?;
        channel
            .queue_bind(
                queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| unavailable("bind queue", e))?;
        if let Err(e) = channel.close(200, "bound").await {
            tracing::debug!(queue, error = %e, "closing bind channel");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| unavailable("open channel", e))?;
        channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| unavailable("set prefetch", e))?;
        let consumer = channel
            .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| unavailable("consume", e))?;

        let consumer_id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(pump(
            queue.to_string(),
            consumer_id,
            channel,
            consumer,
            tx,
            self.pending.clone(),
            self.next_tag.clone(),
        ));
        Ok(rx)
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let pending = self.take_pending(queue, tag)?;
        Settle::ack(&pending.acker).await.map_err(|e| unavailable("ack", e))
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let pending = self.take_pending(queue, tag)?;
        if !requeue {
            return Settle::nack(&pending.acker, false)
                .await
                .map_err(|e| unavailable("nack", e));
        }

        let mut retry = pending.event.clone();
        retry.attempts += 1;
        let republished = self.publish_to("", queue, &retry).await;
        settle_requeue(&pending.acker, queue, tag, republished).await
    }

    async fn release(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let pending = self.take_pending(queue, tag)?;
        Settle::nack(&pending.acker, true)
            .await
            .map_err(|e| unavailable("release", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_keeps_attempts() {
        let mut event = Event::new("build-requests", json!({"repo_id": "r1"}));
        event.attempts = 2;
        let body = serde_json::to_vec(&event).unwrap();

        let decoded = decode(&body).unwrap();
        assert_eq!(decoded.attempts, 2);
        assert_eq!(decoded.id, event.id);
    }

    #[test]
    fn test_decode_defaults_missing_attempts() {
        let body = json!({
            "id": "6f1c0e8e-3a57-4f43-9c36-1d8f3c8c2a11",
            "routing_key": "build-requests",
            "payload": {},
            "created_at": "2024-01-01T00:00:00Z"
        });
        let event = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.attempts, 0);
        assert!(decode(b"not json").is_err());
    }

    #[derive(Default)]
    struct Recorded {
        calls: Mutex<Vec<&'static str>>,
        fail: bool,
    }

    #[async_trait]
    impl Settle for Recorded {
        async fn ack(&self) -> Result<(), lapin::Error> {
            self.calls.lock().unwrap().push("ack");
            if self.fail {
                return Err(lapin::Error::InvalidChannel(1));
            }
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), lapin::Error> {
            self.calls.lock().unwrap().push(if requeue { "nack-requeue" } else { "nack-drop" });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requeue_acks_original_after_republish() {
        let delivery = Recorded::default();
        settle_requeue(&delivery, "q", 1, Ok(())).await.unwrap();
        assert_eq!(*delivery.calls.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_requeue_falls_back_to_nack() {
        let delivery = Recorded::default();
        let failed = Err(BrokerError::Unavailable("publish: channel closed".to_string()));
        settle_requeue(&delivery, "q", 1, failed).await.unwrap();
        assert_eq!(*delivery.calls.lock().unwrap(), vec!["nack-requeue"]);
    }

    #[tokio::test]
    async fn test_requeue_ack_failure_reported() {
        let delivery = Recorded {
            fail: true,
            ..Recorded::default()
        };
        let err = settle_requeue(&delivery, "q", 1, Ok(())).await.unwrap_err();
        assert!(err.to_string().contains("ack requeued"));
    }

    #[test]
    fn test_properties_are_persistent_json() {
        let event = Event::new("notifications", json!({}));
        let properties = properties_for(&event);
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            properties.message_id().as_ref().map(|id| id.as_str().to_string()),
            Some(event.id.to_string())
        );
    }

    #[test]
    fn test_unavailable_names_operation() {
        let err = unavailable("publish", lapin::Error::InvalidChannel(7));
        assert!(err.to_string().starts_with("broker unavailable: publish:"));
    }
}
