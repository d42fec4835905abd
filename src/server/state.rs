use std::sync::Arc;

use crate::ingest::IngestService;

/// 应用状态
pub struct AppState {
    /// 摄取调度器，持有缓存、存储与推理服务的句柄
    pub ingest: Arc<IngestService>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(ingest: Arc<IngestService>) -> Arc<Self> {
        Arc::new(AppState { ingest })
    }
}
