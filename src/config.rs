use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "", "imingest").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

/// 摄取参数
#[derive(Parser, Debug, Clone)]
pub struct IngestOptions {
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png,webp")]
    pub suffix: String,
    /// 单批发送给推理服务的最大图片数量
    #[arg(short, long, value_name = "N", default_value_t = 16)]
    pub batch_size: usize,
    /// 同时在途的推理批次数量，默认为 CPU 核数
    #[arg(short = 'w', long, value_name = "N", default_value_t = num_cpus::get())]
    pub max_workers: usize,
    /// 每个推理批次的最大尝试次数
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub ml_retries: u32,
    /// 首次重试前的等待毫秒数，之后逐次翻倍
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub ml_retry_delay_ms: u64,
}

impl IngestOptions {
    /// 首次重试的退避时长
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.ml_retry_delay_ms)
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            suffix: "jpg,jpeg,png,webp".to_string(),
            batch_size: 16,
            max_workers: num_cpus::get(),
            ml_retries: 3,
            ml_retry_delay_ms: 500,
        }
    }
}

/// 外部协作服务地址
#[derive(Parser, Debug, Clone)]
pub struct EndpointOptions {
    /// ML 推理服务地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8001")]
    pub ml_url: String,
    /// 单次推理请求的超时秒数
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub ml_timeout: u64,
    /// 向量数据库地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:6333")]
    pub qdrant_url: String,
    /// 向量集合名称
    #[arg(long, value_name = "NAME", default_value = "images")]
    pub collection: String,
    /// 嵌入向量维数，由嵌入模型决定
    #[arg(long, value_name = "DIM", default_value_t = 512)]
    pub dim: usize,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imingest", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// imingest 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 扫描目录并摄取图片
    Ingest(IngestCommand),
    /// 启动 HTTP 摄取服务
    Server(ServerCommand),
    /// 清空嵌入缓存
    Clean(CleanCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回嵌入缓存数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("imingest.db")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
