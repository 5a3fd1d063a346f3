//! Message broker abstraction.
//!
//! Every subscription on a topic receives every published event (fan-out);
//! consumers sharing one subscription compete for its messages. A delivery
//! must be acked or nacked; dropping it unsettled counts as a nack. A closed
//! topic rejects publishes and new subscriptions; its consumers drain what is
//! queued and then see the end of the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::EventEnvelope;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic '{0}' is closed")]
    Closed(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BrokerError>;

    /// Attach a consumer to `subscription` on `topic`, creating it on first use.
    async fn subscribe(&self, topic: &str, subscription: &str)
    -> Result<Subscription, BrokerError>;

    /// Stop accepting events on `topic`.
    async fn close(&self, topic: &str);
}

#[derive(Debug, Clone)]
struct Message {
    envelope: EventEnvelope,
    attempt: u32,
}

#[derive(Debug, Clone, Copy)]
struct RedeliveryPolicy {
    max_attempts: u32,
    delay: Duration,
}

/// Consumer end of a subscription.
pub struct Subscription {
    name: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    requeue: mpsc::UnboundedSender<Message>,
    closed: watch::Receiver<bool>,
    policy: RedeliveryPolicy,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next delivery, or `None` once the topic is closed and drained.
    pub async fn next(&mut self) -> Option<Delivery> {
        let mut rx = self.rx.lock().await;
        let message = tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = self.closed.wait_for(|closed| *closed) => rx.try_recv().ok(),
        }?;
        drop(rx);
        Some(Delivery {
            message,
            subscription: self.name.clone(),
            requeue: Some(self.requeue.clone()),
            policy: self.policy,
        })
    }
}

/// One received event awaiting settlement.
pub struct Delivery {
    message: Message,
    subscription: String,
    requeue: Option<mpsc::UnboundedSender<Message>>,
    policy: RedeliveryPolicy,
}

impl Delivery {
    pub fn envelope(&self) -> &EventEnvelope {
        &self.message.envelope
    }

    /// 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.message.attempt
    }

    pub fn ack(mut self) {
        self.requeue = None;
    }

    pub fn nack(mut self) {
        self.redeliver();
    }

    fn redeliver(&mut self) {
        let Some(requeue) = self.requeue.take() else {
            return;
        };
        let envelope = &self.message.envelope;
        if self.message.attempt >= self.policy.max_attempts {
            error!(
                subscription = %self.subscription,
                event_id = %envelope.id,
                resource_id = %envelope.data.resource_id,
                attempts = self.message.attempt,
                "Dropping event after max delivery attempts"
            );
            return;
        }

        let next = Message {
            envelope: envelope.clone(),
            attempt: self.message.attempt + 1,
        };
        debug!(
            subscription = %self.subscription,
            event_id = %next.envelope.id,
            attempt = next.attempt,
            "Scheduling redelivery"
        );
        let delay = self.policy.delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !delay.is_zero() => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(next);
                });
            }
            _ => {
                let _ = requeue.send(next);
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.requeue.is_some() {
            warn!(
                subscription = %self.subscription,
                event_id = %self.message.envelope.id,
                "Delivery dropped without ack"
            );
            self.redeliver();
        }
    }
}

struct SubscriptionQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

struct Topic {
    subscriptions: HashMap<String, SubscriptionQueue>,
    closed: watch::Sender<bool>,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            closed: watch::Sender::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// In-process broker.
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Topic>>,
    policy: RedeliveryPolicy,
}

impl MemoryBroker {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::with_redelivery(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_REDELIVERY_DELAY)
    }

    pub fn with_redelivery(max_attempts: u32, delay: Duration) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            policy: RedeliveryPolicy {
                max_attempts: max_attempts.max(1),
                delay,
            },
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BrokerError> {
        let topics = self.topics.read().await;
        let Some(entry) = topics.get(topic) else {
            debug!(topic, event_id = %envelope.id, "No subscriptions, event dropped");
            return Ok(());
        };
        if entry.is_closed() {
            return Err(BrokerError::Closed(topic.to_string()));
        }
        if entry.subscriptions.is_empty() {
            debug!(topic, event_id = %envelope.id, "No subscriptions, event dropped");
            return Ok(());
        }
        for (name, queue) in &entry.subscriptions {
            let message = Message {
                envelope: envelope.clone(),
                attempt: 1,
            };
            if queue.tx.send(message).is_err() {
                warn!(topic, subscription = %name, "Subscription queue closed");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Subscription, BrokerError> {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        if entry.is_closed() {
            return Err(BrokerError::Closed(topic.to_string()));
        }
        let queue = entry
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                SubscriptionQueue {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            });
        Ok(Subscription {
            name: subscription.to_string(),
            rx: Arc::clone(&queue.rx),
            requeue: queue.tx.clone(),
            closed: entry.closed.subscribe(),
            policy: self.policy,
        })
    }

    async fn close(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        if entry.closed.send_replace(true) {
            return;
        }
        debug!(topic, subscriptions = entry.subscriptions.len(), "Topic closed");
    }
}
