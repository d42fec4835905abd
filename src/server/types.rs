use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 摄取请求参数
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// 待扫描的目录路径
    pub path: String,
    /// 单批最大图片数量，缺省使用服务配置
    pub batch_size: Option<usize>,
    /// 同时在途的批次数量，缺省使用服务配置
    pub max_workers: Option<usize>,
}

/// 摄取响应，返回后通过 `GET /jobs/{id}` 轮询进度
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub job_id: String,
}

/// 归档请求
///
/// file_paths 缺省或为空时归档该任务当前的全部重复文件
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
}

/// 缓存清理响应
#[derive(Debug, Serialize, ToSchema)]
pub struct ClearCacheResponse {
    /// 清理前的缓存条目数量
    pub cleared: u64,
}
