mod resources;
mod statuses;

use axum::{Json, http::HeaderMap};
use fleet_core::ResourceKind;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::problem::ApiError;
use crate::audit::ApiAuditLogger;
use crate::store::DataStore;

pub use resources::*;
pub use statuses::*;

/// Header carrying a client-chosen key that makes a write retry-safe.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub audit: Arc<ApiAuditLogger>,
}

/// Resolve the `{kind}` path segment.
fn parse_kind(segment: &str) -> Result<ResourceKind, ApiError> {
    segment.parse().map_err(|e: fleet_core::model::UnknownKind| {
        ApiError::new(axum::http::StatusCode::NOT_FOUND, "UNKNOWN_KIND", e.to_string())
    })
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Version information
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/api/v1/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
