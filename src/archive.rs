use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::job::Job;

/// 归档目录名，位于原文件的同级目录下
const ARCHIVE_DIR: &str = "_duplicates";

/// 路径不在任务的重复列表中
#[derive(Debug, Error)]
#[error("重复列表中不存在该路径: {0}")]
pub struct DuplicateNotFound(pub String);

/// 归档操作的逐路径结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ArchiveResult {
    /// 成功移入归档目录的路径
    pub archived: Vec<String>,
    /// 失败的路径及原因
    pub failed: Vec<ArchiveFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ArchiveFailure {
    pub file_path: String,
    pub error: String,
}

/// 归档指定的重复文件
///
/// 每个路径独立尝试，单条失败不影响其余路径；重复文件只会被移动，
/// 永远不会被自动删除，删除与否始终由人决定
pub async fn archive_selected(job: &Job, file_paths: &[String]) -> ArchiveResult {
    let mut result = ArchiveResult::default();
    for path in file_paths {
        match archive_one(job, path).await {
            Ok(dest) => {
                job.append_log(format!("已归档重复文件: {} -> {}", path, dest.display()));
                result.archived.push(path.clone());
            }
            Err(e) => {
                result.failed.push(ArchiveFailure {
                    file_path: path.clone(),
                    error: format!("{e:#}"),
                });
            }
        }
    }
    result
}

/// 归档任务当前记录的全部重复文件
///
/// 任务可能仍在运行，列表随时增长，因此只处理调用时刻的快照
pub async fn archive_all(job: &Job) -> ArchiveResult {
    let snapshot = job.duplicate_paths();
    archive_selected(job, &snapshot).await
}

async fn archive_one(job: &Job, path: &str) -> Result<PathBuf> {
    if !job.contains_duplicate(path) {
        return Err(DuplicateNotFound(path.to_string()).into());
    }

    let src = Path::new(path);
    let parent = src.parent().context("无法确定父目录")?;
    let file_name = src.file_name().context("无法确定文件名")?;

    let dest_dir = parent.join(ARCHIVE_DIR);
    tokio::fs::create_dir_all(&dest_dir)
        .await
        .with_context(|| format!("创建归档目录失败: {}", dest_dir.display()))?;

    let dest = unique_dest(&dest_dir, file_name.to_string_lossy().as_ref());
    tokio::fs::rename(src, &dest)
        .await
        .with_context(|| format!("移动文件失败: {path}"))?;

    job.remove_duplicate(path);
    Ok(dest)
}

/// 归档目录中同名文件已存在时，追加序号后缀
fn unique_dest(dir: &Path, file_name: &str) -> PathBuf {
    let dest = dir.join(file_name);
    if !dest.exists() {
        return dest;
    }
    for i in 1.. {
        let candidate = dir.join(format!("{i}-{file_name}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
