use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 批量推理请求中的单个条目
#[derive(Debug, Clone, Serialize)]
pub struct InferenceInput {
    /// 条目唯一标识，此处直接使用内容哈希
    pub unique_id: String,
    /// 图片在共享文件系统上的路径
    pub image_path: String,
}

/// 单个条目的推理结果
///
/// embedding 与 error 互斥：批内允许部分条目失败，失败条目只带 error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub unique_id: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// ML 推理服务接口：批量计算嵌入与描述
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// 一次调用处理一批图片，整体失败时返回 Err，批内单条失败通过
    /// [`InferenceOutput::error`] 报告
    async fn embed_batch(&self, items: &[InferenceInput]) -> Result<Vec<InferenceOutput>>;
}

#[derive(Deserialize)]
struct InferenceResponse {
    results: Vec<InferenceOutput>,
}

/// 通过 HTTP 调用旁路的 CLIP/BLIP 推理服务
pub struct HttpInferenceService {
    client: reqwest::Client,
    url: String,
}

impl HttpInferenceService {
    /// `timeout` 约束单次批量请求，超时由调度器按策略重试
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!("{}/batch_embed_and_caption", base_url.trim_end_matches('/'));
        Ok(Self { client, url })
    }
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    async fn embed_batch(&self, items: &[InferenceInput]) -> Result<Vec<InferenceOutput>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "items": items }))
            .send()
            .await
            .context("推理服务请求失败")?
            .error_for_status()
            .context("推理服务返回错误状态")?;

        let body: InferenceResponse = resp.json().await.context("解析推理响应失败")?;
        Ok(body.results)
    }
}
