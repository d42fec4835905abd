use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::utils::job_token;

/// 单个任务最多保留的日志行数，超出后丢弃最早的行
const MAX_LOG_LINES: usize = 1000;
/// 注册表最多保留的已结束任务数量，超出后按创建顺序淘汰
const MAX_FINISHED_JOBS: usize = 64;

/// 任务状态机：queued → running → completed / failed
///
/// completed / failed 为终态，不允许再转移
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// 任务完成时的统计结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    /// 扫描到的图片总数
    pub total: usize,
    /// 本次新处理并入库的数量
    pub processed: usize,
    /// 缓存命中、无需推理的数量
    pub cached: usize,
    /// 处理失败的数量
    pub failed: usize,
    /// 检出的重复文件数量
    pub duplicates: usize,
}

/// 摄取过程中发现的重复文件
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DuplicateEntry {
    /// 本次扫描遇到的文件路径
    pub file_path: String,
    /// 已存在记录的载荷
    #[schema(value_type = Object)]
    pub existing_payload: Value,
}

/// 对外暴露的任务快照
///
/// 在同一把锁下整体克隆生成，progress / logs / status 之间不会出现撕裂读取
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    /// 进度百分比，单调不减，完成时为 100
    pub progress: f32,
    pub message: String,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    pub exact_duplicates: Vec<DuplicateEntry>,
    pub result: Option<JobSummary>,
}

#[derive(Debug, Error)]
#[error("任务不存在: {0}")]
pub struct JobNotFound(pub String);

#[derive(Debug, Default)]
struct JobInner {
    status: JobStatus,
    progress: f32,
    message: String,
    logs: VecDeque<String>,
    errors: Vec<String>,
    duplicates: Vec<DuplicateEntry>,
    result: Option<JobSummary>,
}

/// 单个摄取任务
///
/// 可变状态由一把互斥锁整体保护，调度器是唯一写入方，
/// 任意数量的轮询方通过 [`Job::snapshot`] 并发读取
pub struct Job {
    id: String,
    inner: Mutex<JobInner>,
    cancelled: AtomicBool,
}

impl Job {
    fn new(id: String) -> Self {
        Self { id, inner: Mutex::new(JobInner::default()), cancelled: AtomicBool::new(false) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().unwrap().status
    }

    /// 追加一行带时间戳的日志，同时作为当前状态消息
    pub fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        let mut inner = self.inner.lock().unwrap();
        inner.message = line.clone();
        inner.logs.push_back(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line));
        if inner.logs.len() > MAX_LOG_LINES {
            inner.logs.pop_front();
        }
    }

    /// 记录一条不致命的错误，任务继续执行
    pub fn append_error(&self, line: impl Into<String>) {
        self.inner.lock().unwrap().errors.push(line.into());
    }

    /// 更新进度百分比，保证单调不减
    pub fn set_progress(&self, pct: f32) {
        let mut inner = self.inner.lock().unwrap();
        inner.progress = inner.progress.max(pct.clamp(0.0, 100.0));
    }

    pub fn mark_running(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == JobStatus::Queued {
            inner.status = JobStatus::Running;
        }
    }

    /// 标记任务成功结束并填入统计结果
    pub fn mark_completed(&self, summary: JobSummary) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() {
            warn!("任务 {} 已结束，忽略重复的状态转移", self.id);
            return;
        }
        inner.status = JobStatus::Completed;
        inner.progress = 100.0;
        inner.result = Some(summary);
    }

    /// 标记任务不可恢复地失败，保留已积累的日志与错误
    pub fn mark_failed(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_terminal() {
            warn!("任务 {} 已结束，忽略重复的状态转移", self.id);
            return;
        }
        inner.status = JobStatus::Failed;
        inner.message = message.into();
    }

    /// 记录一个重复文件，等待调用方决定归档与否
    pub fn push_duplicate(&self, entry: DuplicateEntry) {
        self.inner.lock().unwrap().duplicates.push(entry);
    }

    /// 当前重复列表中是否包含该路径
    pub fn contains_duplicate(&self, path: &str) -> bool {
        self.inner.lock().unwrap().duplicates.iter().any(|d| d.file_path == path)
    }

    /// 从重复列表中移除该路径，返回是否存在
    pub fn remove_duplicate(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.duplicates.len();
        inner.duplicates.retain(|d| d.file_path != path);
        inner.duplicates.len() != before
    }

    /// 当前重复列表的路径快照
    pub fn duplicate_paths(&self) -> Vec<String> {
        self.inner.lock().unwrap().duplicates.iter().map(|d| d.file_path.clone()).collect()
    }

    /// 请求协作式取消，批次之间检查该标记，已在途的批次会继续完成
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 生成内部一致的快照
    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.lock().unwrap();
        JobSnapshot {
            job_id: self.id.clone(),
            status: inner.status,
            progress: inner.progress,
            message: inner.message.clone(),
            logs: inner.logs.iter().cloned().collect(),
            errors: inner.errors.clone(),
            exact_duplicates: inner.duplicates.clone(),
            result: inner.result.clone(),
        }
    }
}

/// 进程级任务注册表
///
/// 各任务的状态相互独立，注册表本身只负责创建、查找与淘汰
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    order: Mutex<VecDeque<String>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个处于 queued 状态的新任务并立即返回
    pub fn create(&self) -> Arc<Job> {
        self.evict_finished();
        let job = Arc::new(Job::new(job_token()));
        self.jobs.write().unwrap().insert(job.id().to_string(), job.clone());
        self.order.lock().unwrap().push_back(job.id().to_string());
        job
    }

    /// 按 ID 查找任务
    pub fn get(&self, job_id: &str) -> Result<Arc<Job>, JobNotFound> {
        self.jobs
            .read()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobNotFound(job_id.to_string()))
    }

    /// 所有保留任务的快照，按创建顺序排列
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().unwrap();
        let order = self.order.lock().unwrap();
        order.iter().filter_map(|id| jobs.get(id)).map(|job| job.snapshot()).collect()
    }

    /// 淘汰最早结束的任务，运行中的任务永不淘汰
    fn evict_finished(&self) {
        let mut jobs = self.jobs.write().unwrap();
        let mut order = self.order.lock().unwrap();

        let mut finished: Vec<String> = order
            .iter()
            .filter(|id| jobs.get(*id).map(|j| j.status().is_terminal()).unwrap_or(false))
            .cloned()
            .collect();
        while finished.len() > MAX_FINISHED_JOBS {
            let id = finished.remove(0);
            jobs.remove(&id);
            order.retain(|x| x != &id);
        }
    }
}
