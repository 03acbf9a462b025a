//! 清理注册表
//!
//! 两张表维护解压产物的生命周期：
//! - 解压注册表：解压根目录 -> 未完成上传任务的引用计数。
//!   计数归零时删除根目录与对应清单。
//! - 压缩包注册表：原始压缩包路径 -> 它产生的解压根集合。
//!   全部根目录移除后删除压缩包本体。
//!
//! 引用计数与上传队列内容的等式在启动时通过扫描恢复的队列重建。
//! 写入者只有上传工作线程；状态查询允许并发读。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::fsutil;
use crate::task::{Task, TaskPayload};

/// 解压根目录状态
#[derive(Debug, Clone)]
struct RootState {
    /// 未完成上传任务的引用计数
    refs: usize,
    /// 原始压缩包路径（恢复的任务可能缺失）
    archive_path: Option<PathBuf>,
    /// 清单文件路径
    manifest_path: Option<PathBuf>,
}

/// 清理注册表
pub struct CleanupRegistry {
    /// 解压根 -> 状态
    roots: DashMap<PathBuf, RootState>,
    /// 压缩包 -> 解压根集合
    archives: DashMap<PathBuf, HashSet<PathBuf>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
            archives: DashMap::new(),
        }
    }

    /// 登记一次解压：压缩包产生了一个解压根
    pub fn register_extraction(
        &self,
        archive_path: &Path,
        extraction_root: &Path,
        manifest_path: &Path,
    ) {
        self.roots
            .entry(extraction_root.to_path_buf())
            .or_insert_with(|| RootState {
                refs: 0,
                archive_path: Some(archive_path.to_path_buf()),
                manifest_path: Some(manifest_path.to_path_buf()),
            });
        self.archives
            .entry(archive_path.to_path_buf())
            .or_default()
            .insert(extraction_root.to_path_buf());
        debug!(
            "登记解压根: {:?} (来自 {:?})",
            extraction_root, archive_path
        );
    }

    /// 增加引用计数（每产生一个引用该根的上传任务调用一次）
    pub fn add_refs(&self, extraction_root: &Path, count: usize) {
        let mut entry = self
            .roots
            .entry(extraction_root.to_path_buf())
            .or_insert_with(|| RootState {
                refs: 0,
                archive_path: None,
                manifest_path: None,
            });
        entry.refs += count;
    }

    /// 释放一个引用；计数归零时执行清理，返回根目录是否被移除
    pub fn release_ref(&self, extraction_root: &Path) -> bool {
        let cleanup = {
            let mut entry = match self.roots.get_mut(extraction_root) {
                Some(e) => e,
                None => {
                    warn!("释放未登记的解压根引用: {:?}", extraction_root);
                    return false;
                }
            };
            if entry.refs > 0 {
                entry.refs -= 1;
            }
            if entry.refs == 0 {
                Some((entry.archive_path.clone(), entry.manifest_path.clone()))
            } else {
                None
            }
        };

        let (archive_path, manifest_path) = match cleanup {
            Some(v) => v,
            None => return false,
        };

        // 计数归零：删根目录、清单，并更新压缩包注册表
        self.roots.remove(extraction_root);
        fsutil::remove_dir_all_quiet(extraction_root);
        if let Some(manifest) = manifest_path {
            fsutil::remove_file_quiet(&manifest);
        }
        if let Some(parent) = extraction_root.parent() {
            fsutil::remove_dir_if_empty(parent);
        }
        info!("解压根已清理: {:?}", extraction_root);

        if let Some(archive) = archive_path {
            let all_removed = {
                let mut set = match self.archives.get_mut(&archive) {
                    Some(s) => s,
                    None => return true,
                };
                set.remove(extraction_root);
                set.is_empty()
            };
            if all_removed {
                self.archives.remove(&archive);
                fsutil::remove_file_quiet(&archive);
                info!("压缩包全部解压根处理完毕，已删除: {:?}", archive);
            }
        }
        true
    }

    /// 当前引用计数（测试与状态查询）
    pub fn ref_count(&self, extraction_root: &Path) -> usize {
        self.roots
            .get(extraction_root)
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    /// 启动时从恢复的队列重建引用计数
    ///
    /// 不变量：解压根的引用计数 == 引用它的未完成上传任务数。
    /// 扫描所有待执行任务，逐条计入。
    pub fn rebuild_refs<'a, I: Iterator<Item = &'a Task>>(&self, tasks: I) {
        let mut counted = 0usize;
        for task in tasks {
            if let Some(root) = upload_root_of(task) {
                self.add_refs(root, 1);
                counted += 1;
            }
        }
        if counted > 0 {
            info!("清理注册表重建: {} 个上传任务引用已计入", counted);
        }
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 任务若是引用解压根的上传任务，返回该根
fn upload_root_of(task: &Task) -> Option<&Path> {
    match &task.payload {
        TaskPayload::AlbumDispatch { .. } | TaskPayload::DirectUpload { .. } => {
            task.archive.as_ref().map(|a| a.extraction_root.as_path())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ArchiveContext, MediaKind};
    use std::fs;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
        let archive = temp.path().join("A.zip");
        fs::write(&archive, b"zipdata").unwrap();
        let root = temp.path().join("extracted").join("A");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("1.jpg"), b"img").unwrap();
        let manifest = temp.path().join("m1.json");
        fs::write(&manifest, b"{}").unwrap();
        (archive, root, manifest)
    }

    #[test]
    fn test_refcount_lifecycle() {
        let temp = TempDir::new().unwrap();
        let (archive, root, manifest) = setup(&temp);

        let registry = CleanupRegistry::new();
        registry.register_extraction(&archive, &root, &manifest);
        registry.add_refs(&root, 2);
        assert_eq!(registry.ref_count(&root), 2);

        // 第一次释放：保留
        assert!(!registry.release_ref(&root));
        assert!(root.exists());
        assert!(archive.exists());

        // 第二次释放：根目录、清单、压缩包全部清理
        assert!(registry.release_ref(&root));
        assert!(!root.exists());
        assert!(!manifest.exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_archive_with_two_roots() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("A.zip");
        fs::write(&archive, b"zip").unwrap();

        let root1 = temp.path().join("r1");
        let root2 = temp.path().join("r2");
        fs::create_dir_all(&root1).unwrap();
        fs::create_dir_all(&root2).unwrap();

        let registry = CleanupRegistry::new();
        registry.register_extraction(&archive, &root1, &temp.path().join("m1.json"));
        registry.register_extraction(&archive, &root2, &temp.path().join("m2.json"));
        registry.add_refs(&root1, 1);
        registry.add_refs(&root2, 1);

        registry.release_ref(&root1);
        // 只移除了一个根：压缩包保留
        assert!(archive.exists());

        registry.release_ref(&root2);
        assert!(!archive.exists());
    }

    #[test]
    fn test_rebuild_from_restored_tasks() {
        let temp = TempDir::new().unwrap();
        let (_, root, _) = setup(&temp);

        let ctx = ArchiveContext {
            archive_name: "A.zip".to_string(),
            extraction_root: root.clone(),
            manifest_id: "m1".to_string(),
        };
        let tasks: Vec<Task> = (0..3)
            .map(|i| {
                Task::new(
                    i + 1,
                    MediaKind::Image,
                    TaskPayload::AlbumDispatch {
                        files: vec![root.join("1.jpg")],
                        kind: MediaKind::Image,
                        archive_name: "A.zip".to_string(),
                        batch_index: i as usize + 1,
                        total_batches: 3,
                    },
                )
                .with_archive(ctx.clone())
            })
            .collect();

        let registry = CleanupRegistry::new();
        registry.rebuild_refs(tasks.iter());

        // 引用计数等于引用该根的未完成上传任务数
        assert_eq!(registry.ref_count(&root), 3);
    }

    #[test]
    fn test_release_unknown_root_is_noop() {
        let registry = CleanupRegistry::new();
        assert!(!registry.release_ref(Path::new("/nonexistent/root")));
    }
}
