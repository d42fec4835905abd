use std::path::Path;

use anyhow::Result;
use indicatif::ProgressStyle;
use rand::distr::{Alphanumeric, SampleString};
use regex::Regex;

/// 计算文件内容的 blake3 哈希，返回十六进制字符串
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let data = std::fs::read(path.as_ref())?;
    Ok(hash_bytes(&data))
}

/// 计算字节内容的 blake3 哈希
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 根据逗号分隔的后缀列表构建匹配正则
///
/// 例：`jpg,png` => `(?i)^(jpg|png)$`
pub fn suffix_regex(suffix: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("(?i)^({})$", suffix.replace(',', "|")))?)
}

/// 生成随机任务 ID
pub fn job_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 16)
}

/// 默认进度条样式
pub fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap()
        .progress_chars("#>-")
}
