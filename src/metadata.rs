use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use serde_json::{Map, Value, json};

/// 元数据提取接口
///
/// 纯函数语义：无副作用，单文件失败由调用方按空元数据处理，不影响任务
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Map<String, Value>>;
}

/// 默认实现：从文件系统属性提取基础字段
///
/// EXIF/XMP 的完整解析交由推理旁路服务，这里只保证每条记录
/// 都带有最基本的来源信息
#[derive(Default)]
pub struct FsMetadataExtractor;

impl MetadataExtractor for FsMetadataExtractor {
    fn extract(&self, path: &Path) -> Result<Map<String, Value>> {
        let meta = std::fs::metadata(path)?;
        let mut map = Map::new();
        map.insert("file_size".to_string(), json!(meta.len()));
        if let Ok(modified) = meta.modified() {
            if let Ok(epoch) = modified.duration_since(UNIX_EPOCH) {
                map.insert("modified".to_string(), json!(epoch.as_secs()));
            }
        }
        if let Some(name) = path.file_name() {
            map.insert("file_name".to_string(), json!(name.to_string_lossy()));
        }
        if let Some(ext) = path.extension() {
            map.insert("extension".to_string(), json!(ext.to_string_lossy().to_lowercase()));
        }
        Ok(map)
    }
}
