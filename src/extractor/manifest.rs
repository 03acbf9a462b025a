//! 流式解压清单
//!
//! 每个压缩包一份清单（manifests/<id>.json），记录媒体条目总数与
//! 已处理条目名，供崩溃后续展与进度汇报使用。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 清单数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestData {
    /// 压缩包展示名
    pub archive_name: String,
    /// 压缩包路径
    pub archive_path: PathBuf,
    /// 解压根目录
    pub extraction_root: PathBuf,
    /// 媒体条目总数
    pub total_entries: usize,
    /// 已处理（已交给下游）的条目名
    pub processed: BTreeSet<String>,
}

/// 清单文件
pub struct Manifest {
    path: PathBuf,
    data: ManifestData,
}

impl Manifest {
    /// 加载或新建清单
    pub fn load_or_create(
        path: PathBuf,
        archive_name: &str,
        archive_path: &Path,
        extraction_root: &Path,
    ) -> Result<Self> {
        let data = if path.exists() {
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<ManifestData>(&content).ok())
            {
                Some(data) => {
                    info!(
                        "已加载解压清单: {:?} ({}/{} 条目已处理)",
                        path,
                        data.processed.len(),
                        data.total_entries
                    );
                    data
                }
                None => {
                    warn!("解压清单损坏，重新开始: {:?}", path);
                    ManifestData {
                        archive_name: archive_name.to_string(),
                        archive_path: archive_path.to_path_buf(),
                        extraction_root: extraction_root.to_path_buf(),
                        total_entries: 0,
                        processed: BTreeSet::new(),
                    }
                }
            }
        } else {
            ManifestData {
                archive_name: archive_name.to_string(),
                archive_path: archive_path.to_path_buf(),
                extraction_root: extraction_root.to_path_buf(),
                total_entries: 0,
                processed: BTreeSet::new(),
            }
        };
        Ok(Self { path, data })
    }

    /// 设置媒体条目总数
    pub fn set_total(&mut self, total: usize) -> Result<()> {
        if self.data.total_entries != total {
            self.data.total_entries = total;
            self.save()?;
        }
        Ok(())
    }

    /// 标记条目已处理
    pub fn mark_processed(&mut self, entry_name: &str) -> Result<()> {
        if self.data.processed.insert(entry_name.to_string()) {
            self.save()?;
        }
        Ok(())
    }

    /// 条目是否已处理（续展时跳过）
    pub fn is_processed(&self, entry_name: &str) -> bool {
        self.data.processed.contains(entry_name)
    }

    pub fn processed_count(&self) -> usize {
        self.data.processed.len()
    }

    pub fn total_entries(&self) -> usize {
        self.data.total_entries
    }

    pub fn data(&self) -> &ManifestData {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 原子保存
    fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.data).context("序列化清单失败")?;
        std::fs::write(&tmp, content).context("写入清单临时文件失败")?;
        std::fs::rename(&tmp, &self.path).context("清单原子替换失败")?;
        Ok(())
    }
}

/// 扫描清单目录（启动时重建压缩包注册表用）
pub fn scan_manifests(dir: &Path) -> Vec<(String, ManifestData)> {
    let mut result = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return result,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<ManifestData>(&c).ok())
            {
                Some(data) => result.push((id, data)),
                None => warn!("跳过损坏的清单: {:?}", path),
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resume_skips_processed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m1.json");

        {
            let mut manifest = Manifest::load_or_create(
                path.clone(),
                "A.zip",
                Path::new("/work/A.zip"),
                Path::new("/work/extracted/A"),
            )
            .unwrap();
            manifest.set_total(100).unwrap();
            manifest.mark_processed("photos/001.jpg").unwrap();
            manifest.mark_processed("photos/002.jpg").unwrap();
        }

        // 崩溃后重新打开：进度保留
        let manifest = Manifest::load_or_create(
            path,
            "A.zip",
            Path::new("/work/A.zip"),
            Path::new("/work/extracted/A"),
        )
        .unwrap();
        assert_eq!(manifest.total_entries(), 100);
        assert_eq!(manifest.processed_count(), 2);
        assert!(manifest.is_processed("photos/001.jpg"));
        assert!(!manifest.is_processed("photos/003.jpg"));
    }

    #[test]
    fn test_corrupt_manifest_restarts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("m1.json");
        std::fs::write(&path, b"{broken").unwrap();

        let manifest = Manifest::load_or_create(
            path,
            "A.zip",
            Path::new("/work/A.zip"),
            Path::new("/work/extracted/A"),
        )
        .unwrap();
        assert_eq!(manifest.processed_count(), 0);
    }

    #[test]
    fn test_scan_manifests() {
        let temp = TempDir::new().unwrap();
        {
            let mut m = Manifest::load_or_create(
                temp.path().join("a.json"),
                "A.zip",
                Path::new("/work/A.zip"),
                Path::new("/work/extracted/A"),
            )
            .unwrap();
            m.set_total(3).unwrap();
        }
        std::fs::write(temp.path().join("broken.json"), b"???").unwrap();

        let found = scan_manifests(temp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "a");
        assert_eq!(found[0].1.archive_name, "A.zip");
    }
}
