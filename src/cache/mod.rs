//! 内容缓存
//!
//! 以内容指纹（SHA-256）为键的只增集合，端到端成功后插入。
//! 入站侧在哈希之前先用 (文件名, 精确大小) 做一次廉价去重。
//! 加载容错：解析失败记录日志并以空缓存启动，不做复杂恢复。

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// 展示文件名
    pub filename: String,
    /// 字节大小
    pub size: u64,
    /// 首次见到的时间
    pub first_seen: DateTime<Utc>,
    /// 条目状态（目前只有 uploaded）
    pub status: String,
}

/// 内容缓存
///
/// 多读单写：查询走读锁，插入走写锁
pub struct ContentCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ContentCache {
    /// 从磁盘加载缓存
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&content) {
                Ok(map) => {
                    info!("已加载 {} 条内容缓存记录", map.len());
                    map
                }
                Err(e) => {
                    error!("内容缓存解析失败，以空缓存启动: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    /// 指纹是否已处理
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.read().contains_key(fingerprint)
    }

    /// (文件名, 精确大小) 预检：哈希前的廉价去重
    pub fn is_processed_by_name(&self, filename: &str, size: u64) -> bool {
        self.entries
            .read()
            .values()
            .any(|e| e.filename == filename && e.size == size)
    }

    /// 端到端成功后插入缓存并落盘
    pub fn insert(&self, fingerprint: String, filename: String, size: u64) -> Result<()> {
        {
            let mut entries = self.entries.write();
            entries.insert(
                fingerprint.clone(),
                CacheEntry {
                    filename,
                    size,
                    first_seen: Utc::now(),
                    status: "uploaded".to_string(),
                },
            );
        }
        self.save()?;
        debug!("缓存插入指纹: {}", &fingerprint[..16.min(fingerprint.len())]);
        Ok(())
    }

    /// 原子保存（临时文件 + 重命名）
    fn save(&self) -> Result<()> {
        let content = {
            let entries = self.entries.read();
            serde_json::to_string_pretty(&*entries).context("序列化内容缓存失败")?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("写入缓存临时文件失败")?;
        std::fs::rename(&tmp, &self.path).context("缓存文件原子替换失败")?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// 计算文件的 SHA-256 指纹（十六进制）
///
/// 分块读取，低内存主机不整段加载
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("打开文件计算指纹失败: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).context("读取文件失败")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
