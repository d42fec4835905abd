use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// 一张图片处理完成后的完整记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// 文件内容的 blake3 哈希，跨缓存与存储唯一
    pub content_hash: String,
    /// 摄取时的文件路径，可能随文件移动而过时，不参与身份判定
    pub path: String,
    /// CLIP 嵌入向量，维数由嵌入模型决定
    pub embedding: Vec<f32>,
    /// BLIP 图片描述
    pub caption: Option<String>,
    /// EXIF/XMP 等开放元数据，键集合不可静态枚举
    pub metadata: Map<String, Value>,
}

impl ImageRecord {
    /// 写入向量库的载荷，嵌入向量本身不在其中
    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = self.metadata.clone();
        payload.insert("content_hash".to_string(), json!(self.content_hash));
        payload.insert("path".to_string(), json!(self.path));
        if let Some(caption) = &self.caption {
            payload.insert("caption".to_string(), json!(caption));
        }
        payload
    }
}

/// 持久化向量存储接口
///
/// 存储使用自己的不透明点 ID，内容哈希只存在于载荷中，
/// 两套身份体系相互独立
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 确认存储可达，必要时创建集合；任务开始前调用，失败视为致命错误
    async fn ensure_ready(&self) -> Result<()>;

    /// 按内容哈希查询已存在记录的载荷
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Value>>;

    /// 批量写入记录，一批一次调用以摊薄 I/O
    async fn upsert_batch(&self, records: &[ImageRecord]) -> Result<()>;

    /// 按内容哈希删除记录
    async fn delete_by_hashes(&self, hashes: &[String]) -> Result<()>;
}

/// Qdrant REST 客户端
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dim: usize,
}

impl QdrantStore {
    pub fn new(base_url: &str, collection: &str, dim: usize) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dim,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    /// 按内容哈希过滤的查询条件
    fn hash_filter(hashes: &[String]) -> Value {
        json!({
            "must": [{
                "key": "content_hash",
                "match": if hashes.len() == 1 {
                    json!({ "value": hashes[0] })
                } else {
                    json!({ "any": hashes })
                },
            }]
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_ready(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.collection_url(""))
            .send()
            .await
            .context("无法连接向量数据库")?;
        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("向量数据库返回异常状态: {}", resp.status());
        }

        // 集合不存在则创建
        self.client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": { "size": self.dim, "distance": "Cosine" },
            }))
            .send()
            .await
            .context("创建集合失败")?
            .error_for_status()
            .context("创建集合返回错误状态")?;
        Ok(())
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<Value>> {
        let hashes = [hash.to_string()];
        let resp = self
            .client
            .post(self.collection_url("/points/scroll"))
            .json(&json!({
                "filter": Self::hash_filter(&hashes),
                "limit": 1,
                "with_payload": true,
            }))
            .send()
            .await
            .context("查询向量数据库失败")?
            .error_for_status()
            .context("查询向量数据库返回错误状态")?;

        let body: Value = resp.json().await?;
        Ok(body.pointer("/result/points/0/payload").cloned())
    }

    async fn upsert_batch(&self, records: &[ImageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    // 点 ID 与内容哈希无关，由存储侧身份体系决定
                    "id": rand::random::<u64>(),
                    "vector": record.embedding,
                    "payload": record.payload(),
                })
            })
            .collect();

        self.client
            .put(self.collection_url("/points"))
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("写入向量数据库失败")?
            .error_for_status()
            .context("写入向量数据库返回错误状态")?;
        Ok(())
    }

    async fn delete_by_hashes(&self, hashes: &[String]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.client
            .post(self.collection_url("/points/delete"))
            .json(&json!({ "filter": Self::hash_filter(hashes) }))
            .send()
            .await
            .context("删除向量记录失败")?
            .error_for_status()
            .context("删除向量记录返回错误状态")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_contains_hash_and_metadata() {
        let mut metadata = Map::new();
        metadata.insert("camera".to_string(), json!("X100V"));
        let record = ImageRecord {
            content_hash: "abc".to_string(),
            path: "/photos/a.jpg".to_string(),
            embedding: vec![0.1, 0.2],
            caption: Some("a cat".to_string()),
            metadata,
        };

        let payload = record.payload();
        assert_eq!(payload["content_hash"], json!("abc"));
        assert_eq!(payload["camera"], json!("X100V"));
        assert_eq!(payload["caption"], json!("a cat"));
    }

    #[test]
    fn hash_filter_switches_on_count() {
        let single = QdrantStore::hash_filter(&["a".to_string()]);
        assert_eq!(single["must"][0]["match"]["value"], json!("a"));

        let multi = QdrantStore::hash_filter(&["a".to_string(), "b".to_string()]);
        assert_eq!(multi["must"][0]["match"]["any"], json!(["a", "b"]));
    }
}
