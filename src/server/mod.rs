mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::ingest_handler,
        api::job_status_handler,
        api::jobs_list_handler,
        api::archive_handler,
        api::cancel_handler,
        api::clear_cache_handler,
    ),
    components(schemas(
        types::IngestRequest,
        types::IngestResponse,
        types::ArchiveRequest,
        types::ClearCacheResponse,
        crate::job::JobSnapshot,
        crate::job::JobSummary,
        crate::job::JobStatus,
        crate::job::DuplicateEntry,
        crate::archive::ArchiveResult,
        crate::archive::ArchiveFailure,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest", axum::routing::post(api::ingest_handler))
        .route("/jobs", axum::routing::get(api::jobs_list_handler))
        .route("/jobs/{id}", axum::routing::get(api::job_status_handler))
        .route("/jobs/{id}/archive", axum::routing::post(api::archive_handler))
        .route("/jobs/{id}/cancel", axum::routing::post(api::cancel_handler))
        .route("/cache/clear", axum::routing::post(api::clear_cache_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 请求体限制：1M，接口只接收 JSON
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
