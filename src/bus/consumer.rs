//! Consuming side of the bus.
//!
//! Delivery is at-least-once: an event is acked only after its handler
//! succeeds, and requeued otherwise. Redeliveries of an event that was
//! already handled are dropped by id.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Broker, BusError, Delivery, Event};
use crate::config::MasterConfig;

/// Why a handler did not complete a delivery.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Processing failed. The delivery is requeued and counts toward
    /// dead-lettering.
    #[error("{0}")]
    Failed(String),

    /// This instance may not process the delivery now. It goes back to the
    /// queue untouched for another consumer.
    #[error("deferred: {0}")]
    Deferred(String),
}

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn deferred(reason: impl std::fmt::Display) -> Self {
        Self::Deferred(reason.to_string())
    }
}

/// Processes one event.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Bounded set of handled event ids; the oldest id is evicted first.
#[derive(Debug)]
pub struct ProcessedIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl ProcessedIds {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`; returns false if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Consumer settings
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Deliveries of one event before it is dead-lettered
    pub max_delivery_attempts: u32,
    pub dedup_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            dedup_capacity: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn from_master(config: &MasterConfig) -> Self {
        Self {
            max_delivery_attempts: config.broker.max_delivery_attempts,
            dedup_capacity: config.broker.dedup_capacity,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Duplicate,
    Requeued,
    Deferred,
    DeadLettered,
}

/// Queue consumer. The processed-id set outlives individual `run` calls,
/// so stopping and restarting consumption keeps deduplicating.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    processed: Mutex<ProcessedIds>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            config,
            processed: Mutex::new(ProcessedIds::new(config.dedup_capacity)),
        }
    }

    fn processed(&self) -> MutexGuard<'_, ProcessedIds> {
        match self.processed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Consume `queue` until `cancel` fires or the broker closes the stream.
    pub async fn run(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let mut deliveries = self.broker.consume(queue).await?;
        tracing::info!(queue, "consumer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => {
                        self.process(queue, delivery, handler.as_ref()).await;
                    }
                    None => {
                        tracing::warn!(queue, "delivery stream closed by broker");
                        break;
                    }
                },
            }
        }

        tracing::info!(queue, "consumer stopped");
        Ok(())
    }

    /// Handle one delivery and settle it with the broker.
    pub async fn process(&self, queue: &str, delivery: Delivery, handler: &dyn DeliveryHandler) -> Outcome {
        let Delivery { tag, event } = delivery;

        let duplicate = self.processed().contains(&event.id);
        if duplicate {
            tracing::debug!(queue, event_id = %event.id, "duplicate delivery dropped");
            self.settle_ack(queue, tag).await;
            return Outcome::Duplicate;
        }

        match handler.handle(&event).await {
            Ok(()) => {
                self.processed().insert(event.id);
                self.settle_ack(queue, tag).await;
                Outcome::Handled
            }
            Err(HandlerError::Deferred(reason)) => {
                tracing::debug!(queue, event_id = %event.id, reason = %reason, "delivery deferred");
                if let Err(e) = self.broker.release(queue, tag).await {
                    tracing::warn!(queue, tag, error = %e, "release failed");
                }
                Outcome::Deferred
            }
            Err(e) if event.attempts + 1 >= self.config.max_delivery_attempts => {
                tracing::error!(
                    queue,
                    event_id = %event.id,
                    attempts = event.attempts + 1,
                    error = %e,
                    "delivery dead-lettered"
                );
                self.processed().insert(event.id);
                self.settle_ack(queue, tag).await;
                Outcome::DeadLettered
            }
            Err(e) => {
                tracing::warn!(
                    queue,
                    event_id = %event.id,
                    attempts = event.attempts + 1,
                    error = %e,
                    "handler failed, requeueing"
                );
                if let Err(e) = self.broker.nack(queue, tag, true).await {
                    tracing::warn!(queue, tag, error = %e, "nack failed");
                }
                Outcome::Requeued
            }
        }
    }

    async fn settle_ack(&self, queue: &str, tag: u64) {
        if let Err(e) = self.broker.ack(queue, tag).await {
            tracing::warn!(queue, tag, error = %e, "ack failed");
        }
    }
}
