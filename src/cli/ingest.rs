use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use log::info;
use tokio::time::sleep;

use crate::archive;
use crate::cache::SqliteCache;
use crate::cli::SubCommandExtend;
use crate::config::{EndpointOptions, IngestOptions, Opts};
use crate::inference::HttpInferenceService;
use crate::ingest::IngestService;
use crate::job::JobStatus;
use crate::store::QdrantStore;
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct IngestCommand {
    #[command(flatten)]
    pub ingest: IngestOptions,
    #[command(flatten)]
    pub endpoints: EndpointOptions,
    /// 图片所在目录
    pub path: PathBuf,
    /// 摄取完成后归档全部重复文件
    #[arg(long)]
    pub archive_duplicates: bool,
}

impl SubCommandExtend for IngestCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        std::fs::create_dir_all(opts.conf_dir.path())?;
        let service = Arc::new(build_service(opts, &self.ingest, &self.endpoints).await?);

        let job_id = service.process_directory(self.path.clone(), None, None);
        let job = service.jobs().get(&job_id)?;

        // 轮询任务状态绘制进度条
        let pb = ProgressBar::new(100).with_style(pb_style());
        loop {
            let snap = job.snapshot();
            pb.set_position(snap.progress as u64);
            pb.set_message(snap.message.clone());
            if snap.status.is_terminal() {
                break;
            }
            sleep(Duration::from_millis(200)).await;
        }

        let snap = job.snapshot();
        if snap.status == JobStatus::Failed {
            pb.abandon_with_message("摄取失败");
            bail!("摄取失败: {}", snap.message);
        }
        pb.finish_with_message("摄取完成");

        if let Some(result) = &snap.result {
            info!(
                "共 {} 张: 新增 {}, 缓存命中 {}, 重复 {}, 失败 {}",
                result.total, result.processed, result.cached, result.duplicates, result.failed
            );
        }
        for error in &snap.errors {
            info!("错误: {}", error);
        }

        if !snap.exact_duplicates.is_empty() {
            if self.archive_duplicates {
                let result = archive::archive_all(&job).await;
                info!("归档完成: 成功 {}, 失败 {}", result.archived.len(), result.failed.len());
                for failure in &result.failed {
                    info!("归档失败: {}: {}", failure.file_path, failure.error);
                }
            } else {
                info!("发现 {} 个重复文件，可通过 --archive-duplicates 归档:", snap.exact_duplicates.len());
                for dup in &snap.exact_duplicates {
                    info!("重复: {}", dup.file_path);
                }
            }
        }

        Ok(())
    }
}

/// 按命令行参数组装摄取服务
pub(crate) async fn build_service(
    opts: &Opts,
    ingest: &IngestOptions,
    endpoints: &EndpointOptions,
) -> Result<IngestService> {
    let cache = Arc::new(SqliteCache::open(opts.conf_dir.database()).await?);
    let store = Arc::new(QdrantStore::new(
        &endpoints.qdrant_url,
        &endpoints.collection,
        endpoints.dim,
    )?);
    let inference = Arc::new(HttpInferenceService::new(
        &endpoints.ml_url,
        Duration::from_secs(endpoints.ml_timeout),
    )?);
    Ok(IngestService::new(cache, store, inference).with_options(ingest.clone()))
}
