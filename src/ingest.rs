use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use log::{error, info, warn};
use rayon::prelude::*;
use serde_json::json;
use tokio::task::spawn_blocking;
use walkdir::WalkDir;

use crate::cache::{CacheEntry, CacheStore};
use crate::config::IngestOptions;
use crate::inference::{InferenceInput, InferenceOutput, InferenceService};
use crate::job::{DuplicateEntry, Job, JobRegistry, JobSummary};
use crate::metadata::{FsMetadataExtractor, MetadataExtractor};
use crate::metrics;
use crate::store::{ImageRecord, VectorStore};
use crate::utils::{hash_file, suffix_regex};

/// 摄取调度器
///
/// 持有全部外部协作方的句柄，自身无可变状态；任务状态由 [`JobRegistry`]
/// 管理，缓存与存储由各自的实现保证并发安全
pub struct IngestService {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn VectorStore>,
    inference: Arc<dyn InferenceService>,
    metadata: Arc<dyn MetadataExtractor>,
    jobs: Arc<JobRegistry>,
    opts: IngestOptions,
}

/// 单个推理批次的结果
enum BatchOutcome {
    /// 推理调用成功，逐条结果待合并
    Done(Vec<InferenceOutput>),
    /// 重试耗尽后仍然失败，整批记为逐条错误
    Failed(String),
    /// 任务已取消，批次未派发
    Skipped,
}

impl IngestService {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn VectorStore>,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        Self {
            cache,
            store,
            inference,
            metadata: Arc::new(FsMetadataExtractor),
            jobs: Arc::new(JobRegistry::new()),
            opts: IngestOptions::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataExtractor>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_options(mut self, opts: IngestOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// 提交一个目录摄取任务，立即返回任务 ID，调用方轮询状态
    pub fn process_directory(
        self: &Arc<Self>,
        root: PathBuf,
        batch_size: Option<usize>,
        max_workers: Option<usize>,
    ) -> String {
        let job = self.jobs.create();
        let job_id = job.id().to_string();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_directory(job, root, batch_size, max_workers).await;
        });
        job_id
    }

    /// 执行一个目录摄取任务直至终态
    ///
    /// 致命错误（目录不存在、存储不可达）使任务进入 failed；
    /// 单文件与单批次的失败只累积到任务的错误列表中
    pub async fn run_directory(
        &self,
        job: Arc<Job>,
        root: PathBuf,
        batch_size: Option<usize>,
        max_workers: Option<usize>,
    ) {
        let batch_size = batch_size.unwrap_or(self.opts.batch_size).max(1);
        let max_workers = max_workers.unwrap_or(self.opts.max_workers).max(1);
        if let Err(e) = self.ingest_directory(&job, &root, batch_size, max_workers).await {
            error!("摄取任务 {} 失败: {e:#}", job.id());
            job.append_error(format!("{e:#}"));
            job.mark_failed(format!("{e:#}"));
        }
    }

    async fn ingest_directory(
        &self,
        job: &Arc<Job>,
        root: &Path,
        batch_size: usize,
        max_workers: usize,
    ) -> Result<()> {
        if !root.is_dir() {
            bail!("目标目录不存在: {}", root.display());
        }
        self.store.ensure_ready().await.context("向量存储不可用")?;

        job.mark_running();
        job.append_log(format!("开始扫描目录: {}", root.display()));

        // 扫描：按后缀过滤，其余文件静默跳过
        let re_suf = suffix_regex(&self.opts.suffix)?;
        let entries: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| {
                entry.ok().and_then(|entry| {
                    let path = entry.path();
                    if path.is_file() {
                        if let Some(ext) = path.extension() {
                            if re_suf.is_match(&ext.to_string_lossy()) {
                                return Some(path.to_path_buf());
                            }
                        }
                    }
                    None
                })
            })
            .collect();
        let total = entries.len();
        info!("扫描完成，共 {} 张图片", total);
        job.append_log(format!("扫描完成，共 {} 张图片", total));

        let mut summary = JobSummary { total, ..Default::default() };
        if total == 0 {
            job.mark_completed(summary);
            return Ok(());
        }

        // 哈希计算是 CPU 密集操作，整体放到 blocking 线程池上并行执行
        let hashed: Vec<(PathBuf, Result<String>)> = spawn_blocking(move || {
            entries.into_par_iter().map(|path| { let hash = hash_file(&path); (path, hash) }).collect()
        })
        .await?;

        // 分流：缓存命中 / 库内重复 / 本次重复 / 待推理
        let mut seen = HashSet::new();
        let mut misses: Vec<(PathBuf, String)> = vec![];
        for (path, hash) in hashed {
            let hash = match hash {
                Ok(hash) => hash,
                Err(e) => {
                    job.append_error(format!("读取文件失败: {}: {e}", path.display()));
                    summary.failed += 1;
                    metrics::inc_item_errors(1);
                    continue;
                }
            };

            if !seen.insert(hash.clone()) {
                // 同一次扫描中的字节级副本，第一份正常处理，其余进入重复列表
                job.push_duplicate(DuplicateEntry {
                    file_path: path.display().to_string(),
                    existing_payload: json!({ "content_hash": hash }),
                });
                summary.duplicates += 1;
                metrics::inc_duplicate();
                continue;
            }

            if self.cache.lookup(&hash).await?.is_some() {
                summary.cached += 1;
                metrics::inc_cache_hit();
                continue;
            }
            metrics::inc_cache_miss();

            match self.store.find_by_hash(&hash).await {
                Ok(Some(payload)) => {
                    job.push_duplicate(DuplicateEntry {
                        file_path: path.display().to_string(),
                        existing_payload: payload,
                    });
                    summary.duplicates += 1;
                    metrics::inc_duplicate();
                }
                Ok(None) => misses.push((path, hash)),
                Err(e) => {
                    job.append_error(format!("查询存储失败: {}: {e}", path.display()));
                    summary.failed += 1;
                    metrics::inc_item_errors(1);
                }
            }
        }

        let mut handled = summary.cached + summary.duplicates + summary.failed;
        job.set_progress(handled as f32 / total as f32 * 100.0);
        job.append_log(format!(
            "分流完成: 缓存命中 {}, 重复 {}, 待推理 {}",
            summary.cached,
            summary.duplicates,
            misses.len()
        ));

        // 批量推理：每批最多 batch_size 张，最多 max_workers 批在途。
        // 任务状态与缓存的写入集中在本任务内完成，保持单写者纪律
        let batches: Vec<Vec<(PathBuf, String)>> =
            misses.chunks(batch_size).map(|chunk| chunk.to_vec()).collect();
        let n_batches = batches.len();

        let mut stream = futures::stream::iter(batches.into_iter().enumerate().map(
            |(idx, batch)| {
                let job = job.clone();
                async move {
                    // 取消只拦截尚未派发的批次，在途批次允许跑完
                    let outcome = if job.is_cancelled() {
                        BatchOutcome::Skipped
                    } else {
                        match self.run_batch(&batch).await {
                            Ok(results) => BatchOutcome::Done(results),
                            Err(e) => BatchOutcome::Failed(format!("{e:#}")),
                        }
                    };
                    (idx, batch, outcome)
                }
            },
        ))
        .buffer_unordered(max_workers);

        while let Some((idx, batch, outcome)) = stream.next().await {
            match outcome {
                BatchOutcome::Skipped => {
                    job.append_log(format!("批次 {}/{} 因取消被跳过", idx + 1, n_batches));
                }
                BatchOutcome::Failed(e) => {
                    for (path, _) in &batch {
                        job.append_error(format!("推理失败: {}: {e}", path.display()));
                    }
                    summary.failed += batch.len();
                    metrics::inc_item_errors(batch.len() as u64);
                    job.append_log(format!(
                        "批次 {}/{} 推理失败，涉及 {} 张图片",
                        idx + 1,
                        n_batches,
                        batch.len()
                    ));
                }
                BatchOutcome::Done(results) => {
                    let (ok, failed) = self.merge_batch(job, &batch, results).await?;
                    summary.processed += ok;
                    summary.failed += failed;
                    job.append_log(format!(
                        "批次 {}/{} 完成: 成功 {}, 失败 {}",
                        idx + 1,
                        n_batches,
                        ok,
                        failed
                    ));
                }
            }
            handled += batch.len();
            job.set_progress(handled as f32 / total as f32 * 100.0);
        }

        if job.is_cancelled() {
            job.append_log("任务被取消，已完成的批次保留".to_string());
        }
        job.append_log(format!(
            "摄取完成: 新增 {}, 缓存命中 {}, 重复 {}, 失败 {}",
            summary.processed, summary.cached, summary.duplicates, summary.failed
        ));
        job.mark_completed(summary);
        Ok(())
    }

    /// 调用推理服务处理一批图片，失败时按指数退避重试
    async fn run_batch(&self, batch: &[(PathBuf, String)]) -> Result<Vec<InferenceOutput>> {
        let items: Vec<InferenceInput> = batch
            .iter()
            .map(|(path, hash)| InferenceInput {
                unique_id: hash.clone(),
                image_path: path.display().to_string(),
            })
            .collect();

        let attempts = self.opts.ml_retries.max(1);
        let mut delay = self.opts.retry_delay();
        for attempt in 1..=attempts {
            match self.inference.embed_batch(&items).await {
                Ok(results) => {
                    metrics::inc_batch();
                    return Ok(results);
                }
                Err(e) if attempt < attempts => {
                    warn!("推理批次失败（第 {attempt} 次尝试）: {e:#}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// 将一个批次的推理结果落到存储与缓存，返回（成功数，失败数）
    async fn merge_batch(
        &self,
        job: &Arc<Job>,
        batch: &[(PathBuf, String)],
        results: Vec<InferenceOutput>,
    ) -> Result<(usize, usize)> {
        let mut by_id: HashMap<String, InferenceOutput> =
            results.into_iter().map(|r| (r.unique_id.clone(), r)).collect();

        let mut records = vec![];
        let mut failed = 0;
        for (path, hash) in batch {
            let output = match by_id.remove(hash) {
                Some(output) => output,
                None => {
                    job.append_error(format!("推理结果缺失: {}", path.display()));
                    failed += 1;
                    continue;
                }
            };
            if let Some(e) = output.error {
                job.append_error(format!("推理失败: {}: {e}", path.display()));
                failed += 1;
                continue;
            }
            let Some(embedding) = output.embedding else {
                job.append_error(format!("推理结果缺少嵌入向量: {}", path.display()));
                failed += 1;
                continue;
            };

            // 元数据提取失败按空元数据处理，不算错误
            let metadata = self.metadata.extract(path).unwrap_or_default();
            records.push(ImageRecord {
                content_hash: hash.clone(),
                path: path.display().to_string(),
                embedding,
                caption: output.caption,
                metadata,
            });
        }

        if records.is_empty() {
            metrics::inc_item_errors(failed as u64);
            return Ok((0, failed));
        }

        // 一批一次 upsert；存储写入失败整批记为逐条错误，任务继续
        if let Err(e) = self.store.upsert_batch(&records).await {
            for record in &records {
                job.append_error(format!("写入存储失败: {}: {e:#}", record.path));
            }
            failed += records.len();
            metrics::inc_item_errors(failed as u64);
            return Ok((0, failed));
        }

        // 缓存冲突意味着哈希环节存在缺陷，必须上抛使任务失败
        for record in &records {
            self.cache
                .insert(
                    &record.content_hash,
                    CacheEntry {
                        embedding: record.embedding.clone(),
                        caption: record.caption.clone(),
                    },
                )
                .await?;
        }

        metrics::inc_item_errors(failed as u64);
        Ok((records.len(), failed))
    }
}
