//! Sentinel -> broker -> adapters -> fleet API, against a real API server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_api::rest::{AppState, create_router};
use fleet_api::{ApiAuditLogger, DEFAULT_HISTORY_LIMIT, FleetState, MemoryStore, RequiredAdapters};
use fleet_controller::adapter::MemoryActionBackend;
use fleet_controller::{
    Adapter, AdapterConfig, Broker, DecisionConfig, HttpResourceClient, MemoryBroker,
    ResourceClient, Sentinel, SentinelConfig, Subscription, WorkerConfig, run_worker,
};
use fleet_core::ResourceKind;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;

const TOPIC: &str = "fleet.reconcile";

const VALIDATION: &str = r#"
name: validation
resource_kinds: [Cluster]
action:
  template:
    region: "{{ resource.spec.region }}"
postconditions:
  available:
    - field: action.state
      operator: eq
      value: Succeeded
"#;

const DNS: &str = r#"
name: dns
resource_kinds: [Cluster]
env:
  ZONE: fleet.example.com
preconditions:
  - operator: and
    operands:
      - field: adapters[adapter=validation].conditions[type=Available].status
        operator: exists
      - field: adapters[adapter=validation].conditions[type=Available].status
        operator: eq
        value: "True"
action:
  template:
    record: "{{ resource.name }}.{{ resource.spec.region }}.{{ env.ZONE }}"
postconditions:
  available:
    - field: action.state
      operator: eq
      value: Succeeded
  health:
    failure:
      - field: action.output.error
        operator: exists
status_data:
  dns_name: action.output.record
"#;

struct Api {
    addr: SocketAddr,
    http: reqwest::Client,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl Api {
    async fn spawn() -> Self {
        let required: RequiredAdapters = [
            (ResourceKind::Cluster, "validation".to_string()),
            (ResourceKind::Cluster, "dns".to_string()),
        ]
        .into_iter()
        .collect();
        let store = Arc::new(MemoryStore::new(FleetState::new(
            required,
            DEFAULT_HISTORY_LIMIT,
        )));
        let router = create_router(Arc::new(AppState {
            store,
            audit: Arc::new(ApiAuditLogger::new_noop()),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            http: reqwest::Client::new(),
            shutdown_tx,
        }
    }

    fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    async fn create_cluster(&self, name: &str) -> String {
        let resp = self
            .http
            .post(self.url("/clusters"))
            .json(&json!({"name": name, "spec": {"region": "eu"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn cluster(&self, id: &str) -> Value {
        self.http
            .get(self.url(&format!("/clusters/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn statuses(&self, id: &str) -> Vec<Value> {
        self.http
            .get(self.url(&format!("/clusters/{id}/statuses")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

struct Controller {
    sentinel: Sentinel,
    adapters: Vec<(Arc<Adapter>, Subscription)>,
    backends: Vec<Arc<MemoryActionBackend>>,
}

impl Controller {
    async fn new(api: &Api, broker: Arc<MemoryBroker>) -> Self {
        let client: Arc<dyn ResourceClient> =
            Arc::new(HttpResourceClient::new(&api.endpoint()).unwrap());

        let mut adapters = Vec::new();
        let mut backends = Vec::new();
        for yaml in [VALIDATION, DNS] {
            let config = AdapterConfig::from_yaml(yaml).unwrap();
            let subscription = broker.subscribe(TOPIC, &config.name).await.unwrap();
            let backend = Arc::new(MemoryActionBackend::new(Duration::ZERO));
            let adapter = Adapter::with_backend(Arc::new(config), client.clone(), backend.clone());
            adapters.push((Arc::new(adapter), subscription));
            backends.push(backend);
        }

        let sentinel = Sentinel::new(
            client,
            broker,
            SentinelConfig {
                topic: TOPIC.to_string(),
                source: "e2e".to_string(),
                poll_interval: Duration::from_millis(50),
                decision: DecisionConfig {
                    backoff_ready: Duration::from_secs(3600),
                    backoff_not_ready: Duration::ZERO,
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        Self {
            sentinel,
            adapters,
            backends,
        }
    }

    /// One sentinel tick, then every adapter drains its subscription.
    async fn round(&mut self) -> usize {
        let published = self.sentinel.tick().await.published;
        for (adapter, subscription) in &mut self.adapters {
            while let Ok(Some(delivery)) =
                tokio::time::timeout(Duration::from_millis(50), subscription.next()).await
            {
                let event = delivery.envelope().data.clone();
                adapter.handle(&event).await.unwrap();
                delivery.ack();
            }
        }
        published
    }

    async fn run_until_phase(&mut self, api: &Api, id: &str, phase: &str) -> Value {
        for _ in 0..20 {
            self.round().await;
            let cluster = api.cluster(id).await;
            if cluster["status"]["phase"] == phase {
                return cluster;
            }
        }
        panic!("cluster {id} never reached {phase}: {}", api.cluster(id).await);
    }

    fn actions_created(&self) -> Vec<usize> {
        self.backends.iter().map(|b| b.created_count()).collect()
    }
}

#[tokio::test]
async fn test_cluster_reconciles_through_generations() {
    let api = Api::spawn().await;
    let broker = Arc::new(MemoryBroker::new());
    let mut controller = Controller::new(&api, broker).await;

    let id = api.create_cluster("prod").await;
    let cluster = controller.run_until_phase(&api, &id, "Ready").await;
    assert_eq!(cluster["generation"], 1);
    assert_eq!(cluster["status"]["observed_generation"], 1);
    assert_eq!(controller.actions_created(), vec![1, 1]);

    let statuses = api.statuses(&id).await;
    let dns = statuses.iter().find(|s| s["adapter"] == "dns").unwrap();
    assert_eq!(dns["data"]["dns_name"], "prod.eu.fleet.example.com");

    // Ready resources sit out the long backoff.
    assert_eq!(controller.round().await, 0);

    // A spec change is picked up on the next tick and gets new actions.
    let resp = api
        .http
        .patch(api.url(&format!("/clusters/{id}")))
        .json(&json!({"spec": {"region": "us"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_ne!(api.cluster(&id).await["status"]["phase"], "Ready");

    let cluster = controller.run_until_phase(&api, &id, "Ready").await;
    assert_eq!(cluster["generation"], 2);
    assert_eq!(controller.actions_created(), vec![2, 2]);
    let statuses = api.statuses(&id).await;
    let dns = statuses.iter().find(|s| s["adapter"] == "dns").unwrap();
    assert_eq!(dns["observed_generation"], 2);
    assert_eq!(dns["data"]["dns_name"], "prod.us.fleet.example.com");

    // Deletion is one more generation, reconciled to Terminated.
    let resp = api
        .http
        .delete(api.url(&format!("/clusters/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let cluster = controller.run_until_phase(&api, &id, "Terminated").await;
    assert_eq!(cluster["generation"], 3);
    assert_eq!(controller.round().await, 0);

    api.shutdown();
}

#[tokio::test]
async fn test_redelivered_events_do_not_duplicate_actions() {
    let api = Api::spawn().await;
    let broker = Arc::new(MemoryBroker::new());
    let mut controller = Controller::new(&api, broker).await;
    let id = api.create_cluster("dup").await;

    // Publish the same event several times before anything is handled.
    for _ in 0..3 {
        assert_eq!(controller.sentinel.tick().await.published, 1);
    }
    controller.run_until_phase(&api, &id, "Ready").await;
    assert_eq!(controller.actions_created(), vec![1, 1]);

    api.shutdown();
}

#[tokio::test]
async fn test_workers_and_sentinel_loops() {
    let api = Api::spawn().await;
    let broker = Arc::new(MemoryBroker::new());
    let controller = Controller::new(&api, broker).await;
    let Controller {
        sentinel, adapters, ..
    } = controller;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();
    for (adapter, subscription) in adapters {
        tasks.spawn(run_worker(
            adapter,
            subscription,
            WorkerConfig {
                max_concurrency: 4,
                ack_deadline: Duration::from_secs(5),
            },
            shutdown_rx.clone(),
        ));
    }
    let sentinel_shutdown = shutdown_rx.clone();
    tasks.spawn(async move { sentinel.run(sentinel_shutdown).await });

    let ids = [
        api.create_cluster("a").await,
        api.create_cluster("b").await,
        api.create_cluster("c").await,
    ];

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for id in &ids {
        loop {
            if api.cluster(id).await["status"]["phase"] == "Ready" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster {id} not Ready in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    })
    .await
    .unwrap();

    api.shutdown();
}
