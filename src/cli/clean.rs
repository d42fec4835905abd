use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cache::{CacheStore, SqliteCache};
use crate::cli::SubCommandExtend;
use crate::config::Opts;

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {}

impl SubCommandExtend for CleanCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        std::fs::create_dir_all(opts.conf_dir.path())?;
        let cache = SqliteCache::open(opts.conf_dir.database()).await?;
        let count = cache.count().await?;
        info!("清理缓存中……");
        cache.clear().await?;
        info!("清理完成，共移除 {} 条", count);
        Ok(())
    }
}
