use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// 缓存条目，保存一张图片推理得到的派生字段
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// CLIP 嵌入向量
    pub embedding: Vec<f32>,
    /// BLIP 图片描述
    pub caption: Option<String>,
}

/// 相同哈希出现了不同载荷，说明哈希环节存在缺陷，必须上抛而不是覆盖
#[derive(Debug, Error)]
#[error("缓存冲突: 哈希 {hash} 已存在不同的载荷")]
pub struct CacheConflict {
    pub hash: String,
}

/// 嵌入缓存接口，按内容哈希寻址
///
/// 缓存是"这张图片是否已经处理过"的唯一权威，按内容哈希而非路径作为键，
/// 因此对文件移动、重命名和跨目录副本保持不变
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 查询哈希对应的缓存条目，无副作用
    async fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>>;

    /// 插入缓存条目
    ///
    /// 重复插入相同载荷视为幂等操作；相同哈希但载荷不同时返回 [`CacheConflict`]
    async fn insert(&self, hash: &str, entry: CacheEntry) -> Result<()>;

    /// 清空缓存，此后再次摄取已见过的图片会重新调用推理服务
    async fn clear(&self) -> Result<()>;

    /// 缓存条目数量
    async fn count(&self) -> Result<u64>;
}

/// 进程内缓存，随进程结束而消失
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().unwrap().get(hash).cloned())
    }

    async fn insert(&self, hash: &str, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(hash) {
            Some(existing) if *existing != entry => {
                Err(CacheConflict { hash: hash.to_string() }.into())
            }
            Some(_) => Ok(()),
            None => {
                entries.insert(hash.to_string(), entry);
                Ok(())
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.entries.lock().unwrap().len() as u64)
    }
}

/// SQLite 持久化缓存，重启后依然有效
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// 打开缓存数据库，不存在时自动创建
    pub async fn open(filename: impl AsRef<Path>) -> Result<Self> {
        let filename = filename.as_ref();
        info!("初始化缓存数据库: {}", filename.display());

        let options = SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .filename(filename)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        info!("检查数据库迁移");
        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query("SELECT embedding, caption FROM cache_entry WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let blob: Vec<u8> = row.get("embedding");
                Ok(Some(CacheEntry {
                    embedding: decode_f32_blob(&blob)?,
                    caption: row.get("caption"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, hash: &str, entry: CacheEntry) -> Result<()> {
        // NOTE: 先 INSERT OR IGNORE 再回读比较，保证并发任务对同一哈希
        // 的竞争插入不会互相覆盖
        sqlx::query("INSERT OR IGNORE INTO cache_entry (hash, embedding, caption) VALUES (?, ?, ?)")
            .bind(hash)
            .bind(encode_f32_blob(&entry.embedding))
            .bind(&entry.caption)
            .execute(&self.pool)
            .await?;

        let stored = self
            .lookup(hash)
            .await?
            .context("缓存条目插入后立即丢失")?;
        if stored != entry {
            return Err(CacheConflict { hash: hash.to_string() }.into());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entry").execute(&self.pool).await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entry")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// 将向量编码为小端序 f32 字节串
fn encode_f32_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// 从小端序字节串解码向量
fn decode_f32_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("嵌入向量字节数不是 4 的倍数: {}", blob.len());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}
