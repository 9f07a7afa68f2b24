//! Message Bus Client
//!
//! Publishes build-lifecycle events with confirm-and-retry semantics and
//! consumes inbound build requests with at-least-once delivery. The broker
//! itself sits behind [`Broker`]:
//!
//! - [`AmqpBroker`] for deployments
//! - [`InMemoryBroker`] for tests, with failure injection

pub mod amqp;
pub mod client;
pub mod consumer;
pub mod events;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use amqp::AmqpBroker;
pub use client::{MessageBus, PublishPolicy};
pub use consumer::{Consumer, ConsumerConfig, DeliveryHandler, HandlerError, Outcome, ProcessedIds};
pub use events::{LifecycleEvent, INTEGRATIONS_ROUTING_KEY, NOTIFICATIONS_ROUTING_KEY};
pub use memory::InMemoryBroker;

/// Broker-assigned delivery tag, unique per queue.
pub type DeliveryTag = u64;

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: Value,
    /// Number of previous deliveries; 0 on first delivery
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.into(),
            payload,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

/// One delivery of an event to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub event: Event,
}

/// Broker-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: DeliveryTag },
}

/// Bus client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Message broker with routing keys, durable queues and explicit acks.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `event` to every queue bound to its routing key. Returns once
    /// the broker confirms.
    async fn publish(&self, event: &Event) -> Result<(), BrokerError>;

    /// Declare `queue` if needed and bind it to `routing_key`.
    async fn bind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Start consuming `queue`. Deliveries stop when the receiver is dropped;
    /// unacknowledged ones are requeued.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue` the event comes back with
    /// `attempts + 1`; without it the event is discarded.
    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Hand a delivery back unprocessed. The event returns to the queue with
    /// its attempt count unchanged.
    async fn release(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError>;
}
