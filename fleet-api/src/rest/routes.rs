use axum::{
    Router, middleware,
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, AppState};
use super::problem;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fleet API",
        version = "0.1.0",
        description = "Desired state of clusters and node pools, adapter status reports and the aggregated readiness derived from them.",
        license(name = "MIT")
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "resources", description = "Cluster and NodePool CRUD"),
        (name = "statuses", description = "Adapter status reports and history")
    ),
    paths(
        handlers::get_version,
        // Resources
        handlers::list_resources,
        handlers::create_resource,
        handlers::get_resource,
        handlers::update_resource,
        handlers::delete_resource,
        // Statuses
        handlers::list_statuses,
        handlers::upsert_status,
        handlers::status_history,
    ),
    components(schemas(
        handlers::VersionInfo,
        handlers::CreateResourceRequest,
        handlers::UpdateResourceRequest,
        problem::ProblemDetails,
        fleet_core::Resource,
        fleet_core::ResourceKind,
        fleet_core::ResourceStatus,
        fleet_core::Phase,
        fleet_core::AggregateCondition,
        fleet_core::AggregateConditionType,
        fleet_core::AdapterStatus,
        fleet_core::AdapterStatusReport,
        fleet_core::Condition,
        fleet_core::ConditionType,
        fleet_core::ConditionStatus,
        crate::command::UpsertStatusResult,
        crate::command::StatusHistoryEntry,
        crate::command::ReportOutcome,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/version", get(handlers::get_version))
        .route(
            "/{kind}",
            get(handlers::list_resources).post(handlers::create_resource),
        )
        .route(
            "/{kind}/{id}",
            get(handlers::get_resource)
                .patch(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route(
            "/{kind}/{id}/statuses",
            get(handlers::list_statuses).post(handlers::upsert_status),
        )
        .route(
            "/{kind}/{id}/statuses/history",
            get(handlers::status_history),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes)
        .fallback(not_found)
        .layer(middleware::from_fn(problem::trace_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn not_found() -> problem::ApiError {
    problem::ApiError::not_found("no such route")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/v1/version",
            "/api/v1/{kind}",
            "/api/v1/{kind}/{id}",
            "/api/v1/{kind}/{id}/statuses",
            "/api/v1/{kind}/{id}/statuses/history",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
