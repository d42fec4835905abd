use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use log::info;
use serde_json::{Value, json};

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::archive;
use crate::job::JobSnapshot;

/// 提交目录摄取任务
#[utoipa::path(
    post,
    path = "/ingest",
    request_body = IngestRequest,
    responses(
        (status = 200, body = IngestResponse),
    )
)]
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>> {
    info!("收到摄取请求: {}", req.path);
    let job_id = state.ingest.process_directory(
        PathBuf::from(&req.path),
        req.batch_size,
        req.max_workers,
    );
    Ok(Json(IngestResponse { job_id }))
}

/// 查询任务状态，可任意频率并发轮询
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = String, Path, description = "任务 ID")),
    responses(
        (status = 200, body = JobSnapshot),
        (status = 404, description = "任务不存在"),
    )
)]
pub async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>> {
    let job = state.ingest.jobs().get(&id)?;
    Ok(Json(job.snapshot()))
}

/// 列出所有保留的任务
#[utoipa::path(
    get,
    path = "/jobs",
    responses(
        (status = 200, body = [JobSnapshot]),
    )
)]
pub async fn jobs_list_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobSnapshot>>> {
    Ok(Json(state.ingest.jobs().snapshots()))
}

/// 归档任务检出的重复文件
///
/// 无请求体表示归档全部
#[utoipa::path(
    post,
    path = "/jobs/{id}/archive",
    params(("id" = String, Path, description = "任务 ID")),
    request_body = ArchiveRequest,
    responses(
        (status = 200, body = archive::ArchiveResult),
        (status = 404, description = "任务不存在"),
    )
)]
pub async fn archive_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<archive::ArchiveResult>> {
    let job = state.ingest.jobs().get(&id)?;
    // 空请求体等价于归档全部
    let req: ArchiveRequest =
        if body.is_empty() { ArchiveRequest::default() } else { serde_json::from_slice(&body)? };
    let result = match req.file_paths {
        Some(paths) => archive::archive_selected(&job, &paths).await,
        None => archive::archive_all(&job).await,
    };
    Ok(Json(result))
}

/// 请求取消任务，在途批次允许跑完
#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    params(("id" = String, Path, description = "任务 ID")),
    responses(
        (status = 200),
        (status = 404, description = "任务不存在"),
    )
)]
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let job = state.ingest.jobs().get(&id)?;
    job.cancel();
    info!("任务 {} 已请求取消", id);
    Ok(Json(json!({})))
}

/// 清空嵌入缓存，此后已见过的图片会重新推理
#[utoipa::path(
    post,
    path = "/cache/clear",
    responses(
        (status = 200, body = ClearCacheResponse),
    )
)]
pub async fn clear_cache_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearCacheResponse>> {
    let cache = state.ingest.cache();
    let cleared = cache.count().await?;
    cache.clear().await?;
    info!("嵌入缓存已清空，共 {} 条", cleared);
    Ok(Json(ClearCacheResponse { cleared }))
}
