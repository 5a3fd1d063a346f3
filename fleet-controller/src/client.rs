//! Resource store client.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{AdapterStatus, AdapterStatusReport, LabelSelector, Resource, ResourceKind};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to resource store failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("resource store returned {status} {code}: {detail}")]
    Api {
        status: u16,
        code: String,
        detail: String,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }
}

/// What the store did with a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Accepted,
    /// Older than what the store already holds for this adapter.
    Stale,
}

/// Read/write access to the resource store used by the sentinel and adapters.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list_resources(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>, ClientError>;

    /// `None` when the resource does not exist.
    async fn get_resource(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<Resource>, ClientError>;

    async fn list_statuses(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Vec<AdapterStatus>, ClientError>;

    async fn upsert_status(
        &self,
        kind: ResourceKind,
        id: &str,
        report: &AdapterStatusReport,
    ) -> Result<UpsertOutcome, ClientError>;
}

#[derive(Deserialize, Default)]
struct Problem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    detail: String,
}

/// [`ResourceClient`] over the REST API.
pub struct HttpResourceClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpResourceClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// `endpoint` is the server root, e.g. `http://[::1]:8080`.
    pub fn new(endpoint: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: format!("{}/api/v1", endpoint.trim_end_matches('/')),
            http,
        })
    }

    fn url(&self, kind: ResourceKind, rest: &str) -> String {
        format!("{}/{}{}", self.base_url, kind.segment(), rest)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        if resp.status().is_success() {
            return Ok(resp.json().await?);
        }
        Err(Self::api_error(resp).await)
    }

    async fn api_error(resp: reqwest::Response) -> ClientError {
        let status = resp.status();
        let problem = resp.json::<Problem>().await.unwrap_or_default();
        ClientError::Api {
            status: status.as_u16(),
            code: problem.code,
            detail: problem.detail,
        }
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn list_resources(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>, ClientError> {
        let mut req = self.http.get(self.url(kind, ""));
        if !selector.is_empty() {
            req = req.query(&[("labels", selector.to_string())]);
        }
        Self::decode(req.send().await?).await
    }

    async fn get_resource(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<Resource>, ClientError> {
        let resp = self.http.get(self.url(kind, &format!("/{id}"))).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(resp).await.map(Some)
    }

    async fn list_statuses(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Vec<AdapterStatus>, ClientError> {
        let resp = self
            .http
            .get(self.url(kind, &format!("/{id}/statuses")))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn upsert_status(
        &self,
        kind: ResourceKind,
        id: &str,
        report: &AdapterStatusReport,
    ) -> Result<UpsertOutcome, ClientError> {
        let resp = self
            .http
            .post(self.url(kind, &format!("/{id}/statuses")))
            .json(report)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(UpsertOutcome::Accepted);
        }
        match Self::api_error(resp).await {
            ClientError::Api { status: 409, code, detail } if code == "STALE_GENERATION" => {
                debug!(resource_id = id, adapter = %report.adapter, %detail, "Stale report");
                Ok(UpsertOutcome::Stale)
            }
            other => Err(other),
        }
    }
}
