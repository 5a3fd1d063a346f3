use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use fleet_core::{AdapterStatus, AdapterStatusReport};
use std::sync::Arc;
use tracing::debug;

use crate::command::{ReportOutcome, StatusHistoryEntry, UpsertStatusResult};
use crate::rest::problem::{ApiError, ProblemDetails};
use crate::store::{StoreError, UpsertStatusRequest};

use super::{AppState, idempotency_key, parse_kind};

/// List adapter statuses of a resource
#[utoipa::path(
    get,
    path = "/api/v1/{kind}/{id}/statuses",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Stored adapter statuses", body = Vec<AdapterStatus>),
        (status = 404, description = "Resource not found", body = ProblemDetails)
    ),
    tag = "statuses"
)]
pub async fn list_statuses(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Vec<AdapterStatus>>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.store.list_statuses(kind, &id).await?))
}

/// Upsert an adapter status
///
/// Reports older than the adapter's stored generation are rejected with
/// `409 STALE_GENERATION`. Reports with `Available=Unknown` are only kept in
/// the history.
#[utoipa::path(
    post,
    path = "/api/v1/{kind}/{id}/statuses",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID"),
        ("idempotency-key" = Option<String>, Header, description = "Makes retries return the first result")
    ),
    request_body = AdapterStatusReport,
    responses(
        (status = 200, description = "Report merged", body = UpsertStatusResult),
        (status = 400, description = "Generation ahead of the resource", body = ProblemDetails),
        (status = 404, description = "Resource not found", body = ProblemDetails),
        (status = 409, description = "Stale generation", body = ProblemDetails)
    ),
    tag = "statuses"
)]
pub async fn upsert_status(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(report): Json<AdapterStatusReport>,
) -> Result<Json<UpsertStatusResult>, ApiError> {
    let kind = parse_kind(&kind)?;
    if report.adapter.trim().is_empty() {
        return Err(ApiError::bad_request("adapter must not be empty"));
    }
    let adapter = report.adapter.clone();
    let generation = report.observed_generation;

    let result = state
        .store
        .upsert_status(
            kind,
            &id,
            UpsertStatusRequest {
                report,
                request_id: idempotency_key(&headers),
            },
        )
        .await;

    match result {
        Ok(result) => {
            match (&result.outcome, &result.adapter_status) {
                (ReportOutcome::Stored, Some(status)) => {
                    state.audit.status_accepted(&result.resource, status);
                }
                _ => state.audit.status_recorded(&id, &adapter, generation),
            }
            Ok(Json(result))
        }
        Err(e @ (StoreError::StaleGeneration(_) | StoreError::InvalidRequest(_))) => {
            debug!(resource_id = %id, adapter = %adapter, error = %e, "status report rejected");
            state.audit.status_rejected(kind, &id, &adapter, &e.to_string());
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Status audit trail of a resource, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/{kind}/{id}/statuses/history",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Received reports", body = Vec<StatusHistoryEntry>),
        (status = 404, description = "Resource not found", body = ProblemDetails)
    ),
    tag = "statuses"
)]
pub async fn status_history(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Vec<StatusHistoryEntry>>, ApiError> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.store.status_history(kind, &id).await?))
}
