//! Worker pool feeding broker deliveries into an adapter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use super::Adapter;
use super::pipeline::{AdapterError, Outcome};
use crate::broker::{Delivery, Subscription};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Events processed at the same time.
    pub max_concurrency: usize,
    /// Time allowed per event before it is nacked for redelivery.
    pub ack_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            ack_deadline: Duration::from_secs(60),
        }
    }
}

/// Consume `subscription` until `shutdown` flips to true, then wait for
/// in-flight events to settle.
pub async fn run_worker(
    adapter: Arc<Adapter>,
    mut subscription: Subscription,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut tasks = JoinSet::new();
    info!(
        adapter = %adapter.name(),
        subscription = %subscription.name(),
        max_concurrency = config.max_concurrency,
        "Adapter worker started"
    );

    loop {
        // Reap finished tasks so the set does not grow unbounded.
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!(adapter = %adapter.name(), "Event task panicked: {e}");
            }
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = subscription.next() => match delivery {
                Some(delivery) => delivery,
                None => {
                    info!(adapter = %adapter.name(), "Subscription closed");
                    break;
                }
            },
        };

        let adapter = Arc::clone(&adapter);
        let span = info_span!(
            "event",
            adapter = %adapter.name(),
            event_id = %delivery.envelope().id,
            resource_id = %delivery.envelope().data.resource_id,
            generation = delivery.envelope().data.generation,
            attempt = delivery.attempt(),
        );
        tasks.spawn(
            async move {
                process(&adapter, delivery, config.ack_deadline).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    info!(
        adapter = %adapter.name(),
        in_flight = tasks.len(),
        "Adapter worker stopping, draining in-flight events"
    );
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(adapter = %adapter.name(), "Event task panicked: {e}");
        }
    }
}

async fn process(adapter: &Adapter, delivery: Delivery, deadline: Duration) {
    let event = delivery.envelope().data.clone();
    let result = match tokio::time::timeout(deadline, adapter.handle(&event)).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(deadline)),
    };

    match result {
        Ok(outcome) => {
            match &outcome {
                Outcome::Reported { report, outcome } => debug!(
                    reason = %report.conditions.first().map(|c| c.reason.as_str()).unwrap_or(""),
                    ?outcome,
                    "Event handled"
                ),
                other => debug!(outcome = ?other, "Event handled"),
            }
            delivery.ack();
        }
        Err(e) => {
            warn!("Event failed, requesting redelivery: {e}");
            delivery.nack();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryActionBackend;
    use crate::broker::{Broker, MemoryBroker};
    use crate::client::{ClientError, ResourceClient, UpsertOutcome};
    use crate::config::AdapterConfig;
    use async_trait::async_trait;
    use fleet_core::{
        AdapterStatus, AdapterStatusReport, EventEnvelope, EventReason, LabelSelector,
        ReconcileEvent, Resource, ResourceKind,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client whose resources never exist; counts lookups.
    #[derive(Default)]
    struct EmptyClient {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ResourceClient for EmptyClient {
        async fn list_resources(
            &self,
            _kind: ResourceKind,
            _selector: &LabelSelector,
        ) -> Result<Vec<Resource>, ClientError> {
            Ok(Vec::new())
        }

        async fn get_resource(
            &self,
            _kind: ResourceKind,
            _id: &str,
        ) -> Result<Option<Resource>, ClientError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(None)
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

    fn envelope(id: &str) -> EventEnvelope {
        EventEnvelope::new(
            "test",
            ReconcileEvent {
                resource_type: ResourceKind::Cluster,
                resource_id: id.to_string(),
                generation: 1,
                reason: EventReason::Manual,
            },
        )
    }

    #[tokio::test]
    async fn test_worker_processes_until_shutdown() {
        let broker = MemoryBroker::new();
        let subscription = broker.subscribe("fleet", "dns").await.unwrap();
        let client = Arc::new(EmptyClient::default());
        let config =
            AdapterConfig::from_yaml("name: dns\nresource_kinds: [Cluster]\naction: {}\n").unwrap();
        let adapter = Arc::new(Adapter::with_backend(
            Arc::new(config),
            client.clone(),
            Arc::new(MemoryActionBackend::new(Duration::ZERO)),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(
            adapter,
            subscription,
            WorkerConfig {
                max_concurrency: 2,
                ack_deadline: Duration::from_secs(5),
            },
            shutdown_rx,
        ));

        for id in ["c1", "c2", "c3"] {
            broker.publish("fleet", envelope(id)).await.unwrap();
        }
        for _ in 0..100 {
            if client.lookups.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.lookups.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
