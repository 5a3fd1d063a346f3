use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use fleet_core::{LabelSelector, Resource};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::rest::problem::{ApiError, ProblemDetails};
use crate::store::{
    CreateResourceRequest as StoreCreateRequest, UpdateResourceRequest as StoreUpdateRequest,
};

use super::{AppState, idempotency_key, parse_kind};

/// Request to create a resource
#[derive(Deserialize, ToSchema)]
pub struct CreateResourceRequest {
    /// Unique name within the kind
    pub name: String,
    /// Owning Cluster ID (NodePools only)
    pub owner_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Desired state
    #[serde(default)]
    #[schema(value_type = Object)]
    pub spec: Value,
}

/// Partial update. `spec` bumps the generation, `labels` does not.
#[derive(Deserialize, ToSchema)]
pub struct UpdateResourceRequest {
    #[schema(value_type = Option<Object>)]
    pub spec: Option<Value>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// Query parameters for list resources
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListResourcesQuery {
    /// Label selector, e.g. `env=prod,shard=a`
    pub labels: Option<String>,
}

/// List resources of a kind
#[utoipa::path(
    get,
    path = "/api/v1/{kind}",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ListResourcesQuery
    ),
    responses(
        (status = 200, description = "Matching resources", body = Vec<Resource>),
        (status = 400, description = "Invalid label selector", body = ProblemDetails),
        (status = 404, description = "Unknown kind", body = ProblemDetails)
    ),
    tag = "resources"
)]
pub async fn list_resources(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<ListResourcesQuery>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    let kind = parse_kind(&kind)?;
    let selector: LabelSelector = match query.labels.as_deref() {
        Some(raw) => raw
            .parse()
            .map_err(|e: fleet_core::model::InvalidSelector| {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_SELECTOR", e.to_string())
            })?,
        None => LabelSelector::default(),
    };
    Ok(Json(state.store.list_resources(kind, &selector).await?))
}

/// Create a resource at generation 1
#[utoipa::path(
    post,
    path = "/api/v1/{kind}",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("idempotency-key" = Option<String>, Header, description = "Makes retries return the first result")
    ),
    request_body = CreateResourceRequest,
    responses(
        (status = 201, description = "Resource created", body = Resource),
        (status = 400, description = "Invalid owner", body = ProblemDetails),
        (status = 404, description = "Unknown kind or owner", body = ProblemDetails),
        (status = 409, description = "Name already exists", body = ProblemDetails)
    ),
    tag = "resources"
)]
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let kind = parse_kind(&kind)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }

    let data = state
        .store
        .create_resource(StoreCreateRequest {
            kind,
            name: req.name,
            owner_id: req.owner_id,
            labels: req.labels,
            spec: req.spec,
            request_id: idempotency_key(&headers),
        })
        .await?;
    state.audit.resource_created(&data);
    Ok((StatusCode::CREATED, Json(data)))
}

/// Get a resource by ID
#[utoipa::path(
    get,
    path = "/api/v1/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Resource found", body = Resource),
        (status = 404, description = "Resource not found", body = ProblemDetails)
    ),
    tag = "resources"
)]
pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Resource>, ApiError> {
    let kind = parse_kind(&kind)?;
    match state.store.get_resource(kind, &id).await? {
        Some(data) => Ok(Json(data)),
        None => Err(ApiError::not_found(format!("{kind} '{id}' not found"))),
    }
}

/// Replace spec and/or labels
#[utoipa::path(
    patch,
    path = "/api/v1/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID"),
        ("idempotency-key" = Option<String>, Header, description = "Makes retries return the first result")
    ),
    request_body = UpdateResourceRequest,
    responses(
        (status = 200, description = "Resource updated", body = Resource),
        (status = 400, description = "Nothing to update", body = ProblemDetails),
        (status = 404, description = "Resource not found", body = ProblemDetails),
        (status = 409, description = "Resource is being deleted", body = ProblemDetails)
    ),
    tag = "resources"
)]
pub async fn update_resource(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<UpdateResourceRequest>,
) -> Result<Json<Resource>, ApiError> {
    let kind = parse_kind(&kind)?;
    let spec_changed = req.spec.is_some();
    let labels_changed = req.labels.is_some();

    let data = state
        .store
        .update_resource(
            kind,
            &id,
            StoreUpdateRequest {
                spec: req.spec,
                labels: req.labels,
                request_id: idempotency_key(&headers),
            },
        )
        .await?;

    if spec_changed {
        state.audit.spec_updated(&data);
    }
    if labels_changed {
        state.audit.labels_updated(&data);
    }
    Ok(Json(data))
}

/// Request deletion (bumps the generation; adapters tear down)
#[utoipa::path(
    delete,
    path = "/api/v1/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "clusters or nodepools"),
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 202, description = "Deletion requested", body = Resource),
        (status = 404, description = "Resource not found", body = ProblemDetails)
    ),
    tag = "resources"
)]
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let kind = parse_kind(&kind)?;
    let data = state
        .store
        .request_deletion(kind, &id, idempotency_key(&headers))
        .await?;
    state.audit.deletion_requested(&data);
    Ok((StatusCode::ACCEPTED, Json(data)))
}
