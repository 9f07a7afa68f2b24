//! In-memory broker with failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::{Broker, BrokerError, Delivery, DeliveryTag, Event};

const CONSUMER_BUFFER: usize = 64;

type ConsumerId = u64;

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<Event>,
    unacked: HashMap<DeliveryTag, (ConsumerId, Event)>,
    next_tag: DeliveryTag,
    notify: Arc<Notify>,
}

impl Queue {
    fn requeue(&mut self, mut event: Event) {
        event.attempts += 1;
        self.restore(event);
    }

    /// Put `event` back at the head without counting a delivery attempt.
    fn restore(&mut self, event: Event) {
        self.ready.push_front(event);
        self.notify.notify_one();
    }
}

/// Injected publish failures
#[derive(Debug, Default)]
struct Failures {
    /// Publishes to reject before succeeding
    fail_next: u32,
    /// Publishes whose confirm is delayed (the message is still routed)
    slow_next: u32,
    slow_delay: Duration,
    /// Reject everything while set
    unavailable: bool,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, Queue>,
    bindings: HashMap<String, Vec<String>>,
    confirmed: Vec<Event>,
    publish_calls: u32,
    next_consumer: ConsumerId,
    failures: Failures,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut Queue {
        self.queues.entry(name.to_string()).or_default()
    }
}

/// In-memory broker.
///
/// Queues are FIFO; a nack with requeue puts the event back at the head
/// with `attempts + 1`. A release, or closing a consumer, puts unacked
/// events back unchanged.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failures.fail_next = count;
    }

    /// Route the next `count` publishes but hold their confirm for `delay`.
    pub fn slow_next_confirms(&self, count: u32, delay: Duration) {
        let mut state = self.lock();
        state.failures.slow_next = count;
        state.failures.slow_delay = delay;
    }

    /// Reject every publish while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().failures.unavailable = unavailable;
    }

    /// Events confirmed so far, in confirm order.
    pub fn confirmed(&self) -> Vec<Event> {
        self.lock().confirmed.clone()
    }

    /// Publish calls received, including rejected ones.
    pub fn publish_calls(&self) -> u32 {
        self.lock().publish_calls
    }

    /// Ready plus unacknowledged messages in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    fn requeue_consumer(&self, queue: &str, consumer: ConsumerId) {
        let mut state = self.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        let mut orphaned: Vec<(DeliveryTag, Event)> = Vec::new();
        q.unacked.retain(|tag, (owner, event)| {
            if *owner == consumer {
                orphaned.push((*tag, event.clone()));
                false
            } else {
                true
            }
        });
        // Oldest delivery ends up at the head.
        orphaned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, event) in orphaned {
            q.restore(event);
        }
    }

    async fn pump(self, queue: String, consumer: ConsumerId, tx: mpsc::Sender<Delivery>, notify: Arc<Notify>) {
        loop {
            let next = {
                let mut state = self.lock();
                let q = state.queue(&queue);
                q.ready.pop_front().map(|event| {
                    let tag = q.next_tag;
                    q.next_tag += 1;
                    q.unacked.insert(tag, (consumer, event.clone()));
                    Delivery { tag, event }
                })
            };

            match next {
                Some(delivery) => {
                    if tx.send(delivery).await.is_err() {
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tx.closed() => break,
                    }
                }
            }
        }
        self.requeue_consumer(&queue, consumer);
        tracing::debug!(queue = %queue, consumer, "consumer closed");
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        let confirm_delay = {
            let mut state = self.lock();
            state.publish_calls += 1;

            if state.failures.unavailable {
                return Err(BrokerError::Unavailable("broker marked unavailable".to_string()));
            }
            if state.failures.fail_next > 0 {
                state.failures.fail_next -= 1;
                return Err(BrokerError::Unavailable("injected publish failure".to_string()));
            }

            let queues = state
                .bindings
                .get(&event.routing_key)
                .cloned()
                .unwrap_or_default();
            for name in queues {
                let q = state.queue(&name);
                q.ready.push_back(event.clone());
                q.notify.notify_one();
            }

            if state.failures.slow_next > 0 {
                state.failures.slow_next -= 1;
                Some(state.failures.slow_delay)
            } else {
                None
            }
        };

        if let Some(delay) = confirm_delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().confirmed.push(event.clone());
        Ok(())
    }

    async fn bind(&self, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.queue(queue);
        let bound = state.bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let (consumer, notify) = {
            let mut state = self.lock();
            let consumer = state.next_consumer;
            state.next_consumer += 1;
            (consumer, state.queue(queue).notify.clone())
        };

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        tokio::spawn(self.clone().pump(queue.to_string(), consumer, tx, notify));
        Ok(rx)
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.queues.get_mut(queue).and_then(|q| q.unacked.remove(&tag)) {
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                tag,
            }),
        }
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue).ok_or_else(|| BrokerError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        })?;
        let (_, event) = q.unacked.remove(&tag).ok_or_else(|| BrokerError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        })?;
        if requeue {
            q.requeue(event);
        }
        Ok(())
    }

    async fn release(&self, queue: &str, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let q = state.queues.get_mut(queue).ok_or_else(|| BrokerError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        })?;
        let (_, event) = q.unacked.remove(&tag).ok_or_else(|| BrokerError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        })?;
        q.restore(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no delivery")
            .expect("consumer closed")
    }

    #[tokio::test]
    async fn test_routes_to_bound_queues_in_order() {
        let broker = InMemoryBroker::new();
        broker.bind("audit", "notifications").await.unwrap();
        let mut rx = broker.consume("audit").await.unwrap();

        for n in 0..3 {
            broker.publish(&Event::new("notifications", json!({"n": n}))).await.unwrap();
        }
        broker.publish(&Event::new("unbound", json!({}))).await.unwrap();

        for n in 0..3 {
            let delivery = next(&mut rx).await;
            assert_eq!(delivery.event.payload["n"], n);
            broker.ack("audit", delivery.tag).await.unwrap();
        }
        assert_eq!(broker.depth("audit"), 0);
        assert_eq!(broker.confirmed().len(), 4);
    }

    #[tokio::test]
    async fn test_nack_requeues_with_attempt_count() {
        let broker = InMemoryBroker::new();
        broker.bind("q", "k").await.unwrap();
        let mut rx = broker.consume("q").await.unwrap();
        broker.publish(&Event::new("k", json!({}))).await.unwrap();

        let first = next(&mut rx).await;
        assert_eq!(first.event.attempts, 0);
        broker.nack("q", first.tag, true).await.unwrap();

        let second = next(&mut rx).await;
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.event.attempts, 1);
        assert_ne!(second.tag, first.tag);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2);

        let event = Event::new("k", json!({}));
        assert!(broker.publish(&event).await.is_err());
        assert!(broker.publish(&event).await.is_err());
        assert!(broker.publish(&event).await.is_ok());
        assert_eq!(broker.publish_calls(), 3);

        broker.set_unavailable(true);
        assert!(matches!(broker.publish(&event).await, Err(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_unacked() {
        let broker = InMemoryBroker::new();
        broker.bind("q", "k").await.unwrap();
        let mut rx = broker.consume("q").await.unwrap();
        broker.publish(&Event::new("k", json!({"n": 1}))).await.unwrap();

        let delivery = next(&mut rx).await;
        drop(rx);

        let mut rx = broker.consume("q").await.unwrap();
        let redelivered = next(&mut rx).await;
        assert_eq!(redelivered.event.id, delivery.event.id);
        assert_eq!(redelivered.event.attempts, 0);
    }

    #[tokio::test]
    async fn test_release_keeps_attempt_count() {
        let broker = InMemoryBroker::new();
        broker.bind("q", "k").await.unwrap();
        let mut rx = broker.consume("q").await.unwrap();
        broker.publish(&Event::new("k", json!({"n": 1}))).await.unwrap();
        broker.publish(&Event::new("k", json!({"n": 2}))).await.unwrap();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        broker.release("q", first.tag).await.unwrap();
        broker.nack("q", second.tag, true).await.unwrap();

        let mut again = vec![next(&mut rx).await, next(&mut rx).await];
        again.sort_by_key(|d| d.event.payload["n"].as_i64());
        assert_eq!(again[0].event.id, first.event.id);
        assert_eq!(again[0].event.attempts, 0);
        assert_eq!(again[1].event.id, second.event.id);
        assert_eq!(again[1].event.attempts, 1);
        assert!(broker.release("q", first.tag).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_unknown_tag() {
        let broker = InMemoryBroker::new();
        broker.bind("q", "k").await.unwrap();
        assert!(matches!(
            broker.ack("q", 42).await,
            Err(BrokerError::UnknownDelivery { tag: 42, .. })
        ));
    }
}
