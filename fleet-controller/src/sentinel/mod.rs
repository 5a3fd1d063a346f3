//! Sentinel: periodically lists resources and publishes reconcile events for
//! the ones that are due.
//!
//! Level triggered and stateless between ticks. Every decision is made from
//! what the store returns on that tick, so a restarted sentinel picks up
//! where the old one left off.

mod decision;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use fleet_core::{
    EventEnvelope, EventReason, LabelSelector, ReconcileEvent, Resource, ResourceKind,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::client::{ClientError, ResourceClient};

pub use decision::{DecisionConfig, decide};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Broker topic events are published to.
    pub topic: String,
    /// `source` of published envelopes.
    pub source: String,
    pub kinds: Vec<ResourceKind>,
    /// Shard of the fleet this sentinel watches.
    pub selector: LabelSelector,
    pub poll_interval: Duration,
    pub decision: DecisionConfig,
    /// Publishes in flight at once.
    pub max_concurrency: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            topic: "fleet.reconcile".to_string(),
            source: "fleet-sentinel".to_string(),
            kinds: ResourceKind::ALL.to_vec(),
            selector: LabelSelector::default(),
            poll_interval: Duration::from_secs(5),
            decision: DecisionConfig::default(),
            max_concurrency: 100,
        }
    }
}

/// Counters of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub listed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct Sentinel {
    client: Arc<dyn ResourceClient>,
    broker: Arc<dyn Broker>,
    config: SentinelConfig,
}

impl Sentinel {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        broker: Arc<dyn Broker>,
        mut config: SentinelConfig,
    ) -> Self {
        config.decision.poll_interval = config.poll_interval;
        Self {
            client,
            broker,
            config,
        }
    }

    /// List every configured kind once and publish for due resources.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let now = Utc::now();
        let mut due: Vec<(Resource, ReconcileEvent)> = Vec::new();

        for &kind in &self.config.kinds {
            let resources = match self.client.list_resources(kind, &self.config.selector).await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(%kind, "Failed to list resources: {e}");
                    continue;
                }
            };
            summary.listed += resources.len();

            for resource in resources {
                if let Some(reason) = decide(&resource, now, &self.config.decision) {
                    let event = ReconcileEvent {
                        resource_type: kind,
                        resource_id: resource.id.clone(),
                        generation: resource.generation,
                        reason,
                    };
                    due.push((resource, event));
                }
            }
        }

        let results: Vec<bool> = stream::iter(due)
            .map(|(resource, event)| self.publish(resource, event))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        for ok in results {
            if ok {
                summary.published += 1;
            } else {
                summary.failed += 1;
            }
        }

        debug!(
            listed = summary.listed,
            published = summary.published,
            failed = summary.failed,
            "Sentinel tick done"
        );
        summary
    }

    async fn publish(&self, resource: Resource, event: ReconcileEvent) -> bool {
        let reason = event.reason;
        let generation = event.generation;
        let envelope = EventEnvelope::new(self.config.source.clone(), event);
        match self.broker.publish(&self.config.topic, envelope).await {
            Ok(()) => {
                debug!(
                    resource_id = %resource.id,
                    generation,
                    phase = ?resource.status.phase,
                    %reason,
                    "Published reconcile event"
                );
                true
            }
            Err(e) => {
                warn!(resource_id = %resource.id, "Failed to publish reconcile event: {e}");
                false
            }
        }
    }

    /// Publish a `Manual` event for one resource, whatever its backoff.
    pub async fn trigger(&self, kind: ResourceKind, id: &str) -> Result<(), TriggerError> {
        let resource = self
            .client
            .get_resource(kind, id)
            .await?
            .ok_or_else(|| TriggerError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        let event = ReconcileEvent {
            resource_type: kind,
            resource_id: resource.id,
            generation: resource.generation,
            reason: EventReason::Manual,
        };
        let envelope = EventEnvelope::new(self.config.source.clone(), event);
        self.broker.publish(&self.config.topic, envelope).await?;
        info!(%kind, resource_id = %id, "Published manual reconcile event");
        Ok(())
    }

    /// Tick every `poll_interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            topic = %self.config.topic,
            kinds = ?self.config.kinds,
            selector = %self.config.selector,
            poll_interval = ?self.config.poll_interval,
            "Sentinel started"
        );
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("Sentinel stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryBroker, Subscription};
    use crate::client::{ClientError, UpsertOutcome};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use fleet_core::{AdapterStatus, AdapterStatusReport, Phase, ResourceStatus};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Broker that rejects every publish while `down` is set.
    #[derive(Default)]
    struct FlakyBroker {
        down: AtomicBool,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, topic: &str, envelope: EventEnvelope) -> Result<(), BrokerError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed(topic.to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push(envelope.data.resource_id);
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &str,
            _subscription: &str,
        ) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Closed(topic.to_string()))
        }

        async fn close(&self, _topic: &str) {}
    }

    struct ListClient {
        resources: Mutex<Vec<Resource>>,
    }

    #[async_trait]
    impl ResourceClient for ListClient {
        async fn list_resources(
            &self,
            kind: ResourceKind,
            selector: &LabelSelector,
        ) -> Result<Vec<Resource>, ClientError> {
            Ok(self
                .resources
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.kind == kind && selector.matches(&r.labels))
                .cloned()
                .collect())
        }

        async fn get_resource(
            &self,
            kind: ResourceKind,
            id: &str,
        ) -> Result<Option<Resource>, ClientError> {
            Ok(self
                .resources
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.kind == kind && r.id == id)
                .cloned())
        }

        async fn list_statuses(
            &self,
            _kind: ResourceKind,
            _id: &str,
        ) -> Result<Vec<AdapterStatus>, ClientError> {
            Ok(Vec::new())
        }

        async fn upsert_status(
            &self,
            _kind: ResourceKind,
            _id: &str,
            _report: &AdapterStatusReport,
        ) -> Result<UpsertOutcome, ClientError> {
            Ok(UpsertOutcome::Accepted)
        }
    }

    fn resource(id: &str, kind: ResourceKind, shard: &str, phase: Phase, generation: u64) -> Resource {
        let t0 = Utc::now() - TimeDelta::minutes(1);
        let mut status = ResourceStatus::new(t0);
        status.phase = phase;
        status.observed_generation = 1;
        Resource {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            owner_id: None,
            labels: BTreeMap::from([("shard".to_string(), shard.to_string())]),
            generation,
            spec: json!({}),
            status,
            created_time: t0,
            updated_time: t0,
            deleted_time: None,
        }
    }

    #[tokio::test]
    async fn test_tick_publishes_due_resources_in_shard() {
        let client = Arc::new(ListClient {
            resources: Mutex::new(vec![
                resource("ready", ResourceKind::Cluster, "a", Phase::Ready, 1),
                resource("updated", ResourceKind::Cluster, "a", Phase::Ready, 2),
                resource("pending", ResourceKind::NodePool, "a", Phase::NotReady, 1),
                resource("other-shard", ResourceKind::Cluster, "b", Phase::NotReady, 1),
            ]),
        });
        let broker = Arc::new(MemoryBroker::new());
        let mut subscription = broker.subscribe("fleet", "dns").await.unwrap();

        let sentinel = Sentinel::new(
            client,
            broker.clone(),
            SentinelConfig {
                topic: "fleet".to_string(),
                selector: "shard=a".parse().unwrap(),
                ..Default::default()
            },
        );

        let summary = sentinel.tick().await;
        assert_eq!(
            summary,
            TickSummary {
                listed: 3,
                published: 2,
                failed: 0
            }
        );

        let mut received = Vec::new();
        for _ in 0..2 {
            let delivery = subscription.next().await.unwrap();
            let data = delivery.envelope().data.clone();
            delivery.ack();
            received.push((data.resource_id, data.reason));
        }
        received.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            received,
            vec![
                ("pending".to_string(), EventReason::BackoffElapsed),
                ("updated".to_string(), EventReason::GenerationChanged),
            ]
        );
    }

    #[tokio::test]
    async fn test_ticks_are_stateless() {
        let client = Arc::new(ListClient {
            resources: Mutex::new(vec![resource(
                "pending",
                ResourceKind::Cluster,
                "a",
                Phase::NotReady,
                1,
            )]),
        });
        let broker = Arc::new(MemoryBroker::new());
        let _subscription = broker.subscribe("fleet", "dns").await.unwrap();
        let sentinel = Sentinel::new(
            client,
            broker,
            SentinelConfig {
                topic: "fleet".to_string(),
                ..Default::default()
            },
        );

        // Nothing changed in the store, so both ticks decide the same way.
        assert_eq!(sentinel.tick().await.published, 1);
        assert_eq!(sentinel.tick().await.published, 1);
    }

    #[tokio::test]
    async fn test_failed_publishes_are_retried_next_tick() {
        let client = Arc::new(ListClient {
            resources: Mutex::new(vec![
                resource("pending", ResourceKind::Cluster, "a", Phase::NotReady, 1),
                resource("updated", ResourceKind::Cluster, "a", Phase::Ready, 2),
                resource("ready", ResourceKind::Cluster, "a", Phase::Ready, 1),
            ]),
        });
        let broker = Arc::new(FlakyBroker::default());
        broker.down.store(true, Ordering::SeqCst);
        let sentinel = Sentinel::new(client, broker.clone(), SentinelConfig::default());

        assert_eq!(
            sentinel.tick().await,
            TickSummary {
                listed: 3,
                published: 0,
                failed: 2
            }
        );
        assert!(broker.published.lock().unwrap().is_empty());

        // Nothing is remembered about the failure: the same resources are due again.
        broker.down.store(false, Ordering::SeqCst);
        assert_eq!(
            sentinel.tick().await,
            TickSummary {
                listed: 3,
                published: 2,
                failed: 0
            }
        );
        let mut published = broker.published.lock().unwrap().clone();
        published.sort();
        assert_eq!(published, vec!["pending".to_string(), "updated".to_string()]);
    }

    #[tokio::test]
    async fn test_trigger_publishes_manual_event() {
        let client = Arc::new(ListClient {
            resources: Mutex::new(vec![resource(
                "ready",
                ResourceKind::Cluster,
                "a",
                Phase::Ready,
                1,
            )]),
        });
        let broker = Arc::new(MemoryBroker::new());
        let mut subscription = broker.subscribe("fleet", "dns").await.unwrap();
        let sentinel = Sentinel::new(
            client,
            broker.clone(),
            SentinelConfig {
                topic: "fleet".to_string(),
                ..Default::default()
            },
        );

        // Not due by backoff, published anyway.
        assert_eq!(sentinel.tick().await.published, 0);
        sentinel.trigger(ResourceKind::Cluster, "ready").await.unwrap();
        let delivery = subscription.next().await.unwrap();
        assert_eq!(delivery.envelope().data.resource_id, "ready");
        assert_eq!(delivery.envelope().data.reason, EventReason::Manual);
        delivery.ack();

        assert!(matches!(
            sentinel.trigger(ResourceKind::NodePool, "ready").await,
            Err(TriggerError::NotFound { .. })
        ));

        broker.close("fleet").await;
        assert!(matches!(
            sentinel.trigger(ResourceKind::Cluster, "ready").await,
            Err(TriggerError::Broker(BrokerError::Closed(_)))
        ));
    }
}
