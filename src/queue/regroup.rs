//! 恢复后的上传队列重组
//!
//! 解压中途崩溃会留下成千上万条单文件上传任务。恢复时把共享
//! (压缩包名, 解压根, 媒体类别) 的 ≥2 条单文件任务合并回相册任务，
//! 文件顺序保持磁盘顺序，已消失的文件跳过。单文件分组保持原样。

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::task::{ArchiveContext, MediaKind, Task, TaskPayload};

/// 分组键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    archive_name: String,
    extraction_root: PathBuf,
    kind: MediaKind,
}

/// 对恢复的上传任务执行相册重组
///
/// # Arguments
/// * `tasks` - 按磁盘顺序回放的上传阶段任务
/// * `album_cap` - 相册上限
/// * `alloc_id` - 新任务 ID 分配器
pub fn regroup_upload_tasks<F: Fn() -> u64>(
    tasks: Vec<Task>,
    album_cap: usize,
    alloc_id: F,
) -> Vec<Task> {
    let before = tasks.len();

    // 第一遍：按分组键归拢可合并的单文件任务
    let mut groups: HashMap<GroupKey, Vec<usize>> = HashMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        if let Some(key) = group_key(task) {
            groups.entry(key).or_default().push(idx);
        }
    }

    // 只合并 ≥2 的分组
    let mut grouped_indices: HashMap<usize, GroupKey> = HashMap::new();
    let mut group_first: HashMap<GroupKey, usize> = HashMap::new();
    for (key, indices) in &groups {
        if indices.len() >= 2 {
            group_first.insert(key.clone(), indices[0]);
            for idx in indices {
                grouped_indices.insert(*idx, key.clone());
            }
        }
    }

    // 第二遍：按原顺序输出；分组在首个成员位置展开为相册任务
    let mut output: Vec<Task> = Vec::new();
    for (idx, task) in tasks.iter().enumerate() {
        match grouped_indices.get(&idx) {
            None => output.push(task.clone()),
            Some(key) => {
                if group_first.get(key) != Some(&idx) {
                    continue;
                }
                let members: Vec<&Task> = groups[key].iter().map(|i| &tasks[*i]).collect();
                output.extend(build_albums(key, &members, album_cap, &alloc_id));
            }
        }
    }

    let after = output.len();
    if after != before {
        info!(
            "相册重组: {} 个单文件任务 -> {} 个任务 (缩减 {:.1}%)",
            before,
            after,
            (1.0 - after as f64 / before as f64) * 100.0
        );
    }
    output
}

/// 单文件上传任务的分组键；不可合并的任务返回 None
fn group_key(task: &Task) -> Option<GroupKey> {
    let archive = task.archive.as_ref()?;
    match &task.payload {
        TaskPayload::DirectUpload { kind, .. }
            if matches!(kind, MediaKind::Image | MediaKind::Video) =>
        {
            Some(GroupKey {
                archive_name: archive.archive_name.clone(),
                extraction_root: archive.extraction_root.clone(),
                kind: *kind,
            })
        }
        _ => None,
    }
}

/// 将一个分组的成员切成相册任务
fn build_albums<F: Fn() -> u64>(
    key: &GroupKey,
    members: &[&Task],
    album_cap: usize,
    alloc_id: &F,
) -> Vec<Task> {
    // 文件已消失的条目跳过
    let mut files: Vec<PathBuf> = Vec::new();
    let mut source_ref = None;
    let mut archive_ctx: Option<ArchiveContext> = None;
    for member in members {
        if let TaskPayload::DirectUpload { file, .. } = &member.payload {
            if !file.exists() {
                warn!("重组跳过已消失的文件: {:?}", file);
                continue;
            }
            files.push(file.clone());
            if source_ref.is_none() {
                source_ref = member.source_ref;
            }
            if archive_ctx.is_none() {
                archive_ctx = member.archive.clone();
            }
        }
    }

    if files.is_empty() {
        return Vec::new();
    }

    let total_batches = files.len().div_ceil(album_cap);
    files
        .chunks(album_cap)
        .enumerate()
        .map(|(i, chunk)| {
            let mut task = Task::new(
                alloc_id(),
                key.kind,
                TaskPayload::AlbumDispatch {
                    files: chunk.to_vec(),
                    kind: key.kind,
                    archive_name: key.archive_name.clone(),
                    batch_index: i + 1,
                    total_batches,
                },
            )
            .with_source(source_ref)
            .with_cleanup(chunk.to_vec());
            if let Some(ctx) = archive_ctx.clone() {
                task = task.with_archive(ctx);
            }
            task
        })
        .collect()
}
