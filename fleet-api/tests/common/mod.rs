//! Shared test utilities for fleet-api integration tests.

#![allow(dead_code)]

use fleet_api::rest::{AppState, create_router};
use fleet_api::{ApiAuditLogger, DEFAULT_HISTORY_LIMIT, FleetState, MemoryStore, RequiredAdapters};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Test server wrapper running the REST API on an in-memory store.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    /// Spawn a test server that aggregates over whichever adapters report.
    pub async fn spawn() -> Self {
        Self::spawn_with(RequiredAdapters::default()).await
    }

    /// Spawn a test server with a fixed set of required adapters.
    pub async fn spawn_with(required: RequiredAdapters) -> Self {
        let store = Arc::new(MemoryStore::new(FleetState::new(
            required,
            DEFAULT_HISTORY_LIMIT,
        )));

        // Create app state with noop audit logger
        let app_state = Arc::new(AppState {
            store,
            audit: Arc::new(ApiAuditLogger::new_noop()),
        });

        let router = create_router(app_state);

        // Port 0 lets the OS choose an available port
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
        let actual_addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        // Small delay to ensure server is ready
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        Self {
            addr: actual_addr,
            client: Client::new(),
            shutdown_tx,
        }
    }

    /// Get base URL for the REST API.
    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// GET and decode the JSON body.
    pub async fn get_json(&self, path: &str) -> Value {
        self.get(path).await.json().await.expect("Invalid JSON")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a PATCH request with JSON body.
    pub async fn patch_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .patch(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a DELETE request.
    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Create a cluster and return its JSON.
    pub async fn create_cluster(&self, name: &str) -> Value {
        let resp = self
            .post_json(
                "/clusters",
                &json!({"name": name, "labels": {"env": "test"}, "spec": {"version": "1.30"}}),
            )
            .await;
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    /// Post an adapter report with the given condition statuses.
    pub async fn report(
        &self,
        cluster_id: &str,
        adapter: &str,
        generation: u64,
        applied: &str,
        available: &str,
        health: &str,
    ) -> ReqwestResponse {
        self.post_json(
            &format!("/clusters/{cluster_id}/statuses"),
            &json!({
                "adapter": adapter,
                "observed_generation": generation,
                "conditions": [
                    {"type": "Applied", "status": applied},
                    {"type": "Available", "status": available},
                    {"type": "Health", "status": health}
                ]
            }),
        )
        .await
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Status of an aggregate condition in a resource JSON.
pub fn aggregate_status(resource: &Value, kind: &str) -> (String, u64) {
    let cond = resource["status"]["conditions"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["type"] == kind)
        .unwrap_or_else(|| panic!("no {kind} condition"));
    (
        cond["status"].as_str().unwrap().to_string(),
        cond["observed_generation"].as_u64().unwrap(),
    )
}
