//! 上传执行
//!
//! 把相册任务或单媒体任务发给出站适配器，并处理两类就地恢复：
//! - 照片超限：质量阶梯压缩出替身，替身入批重试同一相册
//! - 媒体被拒：批次按兼容性二分，兼容部分重新入队为新相册，
//!   不兼容视频转入延迟转换账本，整批不判失败
//!
//! 成功终态的清理（删除 cleanup_refs、引用计数递减、缓存插入）
//! 由上传工作线程在 `UploadResult::Sent` 后执行。

pub mod image_shrink;

use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub use image_shrink::{shrink_image, shrunk_path, PHOTO_SIZE_LIMIT};

use crate::album::AlbumBatch;
use crate::context::AppContext;
use crate::error::{TaskError, TaskResult};
use crate::messenger::OutgoingMedia;
use crate::normalizer::Normalizer;
use crate::task::{MediaKind, Task, TaskPayload};

/// 超限压缩重试次数上限（质量阶梯 + 尺寸阶梯各算一轮）
const MAX_SHRINK_ROUNDS: u32 = 2;

/// 上传执行结果
#[derive(Debug)]
pub enum UploadResult {
    /// 已发送；`substitutes` 为压缩替身等中间文件（一并清理）
    Sent { substitutes: Vec<PathBuf> },
    /// 批次被拆分；后继任务随原任务的成功终态一起入队，
    /// 原批文件不清理（被后继任务引用）
    Split { followups: Vec<Task> },
}

/// 执行一个上传任务
pub async fn execute(ctx: &AppContext, task: &Task) -> TaskResult<UploadResult> {
    match &task.payload {
        TaskPayload::AlbumDispatch {
            files,
            kind,
            archive_name,
            batch_index,
            total_batches,
        } => {
            execute_album(
                ctx,
                task,
                files,
                *kind,
                archive_name,
                *batch_index,
                *total_batches,
            )
            .await
        }
        TaskPayload::DirectUpload {
            file,
            kind,
            file_name,
        } => execute_single(ctx, task, file, *kind, file_name).await,
        other => Err(TaskError::Permanent {
            detail: format!("上传阶段收到非上传任务: {}", other.discriminant()),
        }),
    }
}

/// 发送相册
async fn execute_album(
    ctx: &AppContext,
    task: &Task,
    files: &[PathBuf],
    kind: MediaKind,
    archive_name: &str,
    batch_index: usize,
    total_batches: usize,
) -> TaskResult<UploadResult> {
    // 文件可能在隔离/清理竞争中消失，剩余的照发
    let mut live: Vec<PathBuf> = files.iter().filter(|f| f.exists()).cloned().collect();
    for gone in files.iter().filter(|f| !f.exists()) {
        warn!("相册条目文件已消失，跳过: {:?}", gone);
    }
    if live.is_empty() {
        info!("相册条目全部消失，视为空完成: {}", archive_name);
        return Ok(UploadResult::Sent {
            substitutes: vec![],
        });
    }

    let caption = AlbumBatch {
        files: live.clone(),
        kind,
        archive_name: archive_name.to_string(),
        batch_index,
        total_batches,
    }
    .caption();

    let normalizer = Normalizer::new(&ctx.config.transcode);
    let mut substitutes: Vec<PathBuf> = Vec::new();
    let mut shrink_rounds = 0u32;

    loop {
        let media = build_media(&normalizer, &live, kind).await;
        let result = if media.len() == 1 {
            ctx.messenger.send_media(&media[0], &caption).await
        } else {
            ctx.messenger.send_album(&media, &caption).await
        };

        match result {
            Ok(()) => {
                // 缩略图是临时产物，一并清理
                for item in &media {
                    if let Some(ref thumb) = item.thumbnail {
                        substitutes.push(thumb.clone());
                    }
                }
                return Ok(UploadResult::Sent { substitutes });
            }
            Err(TaskError::PhotoTooLarge) if kind == MediaKind::Image => {
                shrink_rounds += 1;
                if shrink_rounds > MAX_SHRINK_ROUNDS {
                    return Err(TaskError::PhotoTooLarge);
                }
                live = substitute_oversize(&mut substitutes, &live)?;
            }
            Err(TaskError::MediaInvalid { offenders }) => {
                return split_batch(ctx, task, &live, kind, archive_name, &offenders).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 发送单个媒体
async fn execute_single(
    ctx: &AppContext,
    ctx_task: &Task,
    file: &Path,
    kind: MediaKind,
    file_name: &str,
) -> TaskResult<UploadResult> {
    if !file.exists() {
        warn!("上传文件已消失，视为空完成: {:?}", file);
        return Ok(UploadResult::Sent {
            substitutes: vec![],
        });
    }

    let caption = match ctx_task.archive {
        Some(ref archive) => format!("📎 {}\n📦 From: {}", file_name, archive.archive_name),
        None => format!("📎 {}", file_name),
    };

    let normalizer = Normalizer::new(&ctx.config.transcode);
    let mut substitutes = Vec::new();
    let mut current = file.to_path_buf();
    let mut shrink_rounds = 0u32;

    loop {
        let media = build_media(&normalizer, std::slice::from_ref(&current), kind).await;
        let item = media.into_iter().next().ok_or(TaskError::Permanent {
            detail: "媒体构建为空".to_string(),
        })?;
        let thumb = item.thumbnail.clone();

        match ctx.messenger.send_media(&item, &caption).await {
            Ok(()) => {
                substitutes.extend(thumb);
                return Ok(UploadResult::Sent { substitutes });
            }
            Err(TaskError::PhotoTooLarge) if kind == MediaKind::Image => {
                shrink_rounds += 1;
                if shrink_rounds > MAX_SHRINK_ROUNDS {
                    return Err(TaskError::PhotoTooLarge);
                }
                let shrunk = shrink_image(&current, PHOTO_SIZE_LIMIT)?;
                if shrunk != current {
                    substitutes.push(shrunk.clone());
                    current = shrunk;
                }
            }
            Err(TaskError::MediaInvalid { .. }) if kind == MediaKind::Video => {
                // 单视频被拒：直接转延迟转换
                let followup = defer_task(ctx, ctx_task, &current, file_name);
                return Ok(UploadResult::Split {
                    followups: vec![followup],
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// 构建出站媒体列表（视频附带属性与缩略图）
async fn build_media(
    normalizer: &Normalizer,
    files: &[PathBuf],
    kind: MediaKind,
) -> Vec<OutgoingMedia> {
    let mut media = Vec::with_capacity(files.len());
    for file in files {
        let mut item = OutgoingMedia::new(file.clone(), kind);
        if kind == MediaKind::Video {
            let attrs = normalizer.attributes(file).await;
            if attrs.duration_secs > 0 || attrs.width > 0 {
                item.video_attributes = Some(attrs);
            }
            item.thumbnail = normalizer.make_thumbnail(file).await;
        }
        media.push(item);
    }
    media
}

/// 把超限图片替换为压缩替身
fn substitute_oversize(
    substitutes: &mut Vec<PathBuf>,
    files: &[PathBuf],
) -> TaskResult<Vec<PathBuf>> {
    let mut replaced = Vec::with_capacity(files.len());
    let mut any = false;
    for file in files {
        let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        if size > PHOTO_SIZE_LIMIT {
            info!("照片超限，压缩替身: {:?} ({} 字节)", file, size);
            let shrunk = shrink_image(file, PHOTO_SIZE_LIMIT)?;
            if shrunk != *file {
                substitutes.push(shrunk.clone());
                replaced.push(shrunk);
                any = true;
                continue;
            }
        }
        replaced.push(file.clone());
    }
    if !any {
        // 没有可替换项：同一错误必然复现，不再空转
        return Err(TaskError::PhotoTooLarge);
    }
    Ok(replaced)
}

/// 媒体被拒后的批次二分
///
/// 兼容部分重新入队为新相册（同类别），不兼容视频逐个转入
/// 延迟转换；整批不判失败
async fn split_batch(
    ctx: &AppContext,
    task: &Task,
    files: &[PathBuf],
    kind: MediaKind,
    archive_name: &str,
    named_offenders: &[String],
) -> TaskResult<UploadResult> {
    let normalizer = Normalizer::new(&ctx.config.transcode);
    let mut compatible = Vec::new();
    let mut incompatible = Vec::new();

    for file in files {
        let named = named_offenders.iter().any(|n| {
            file.file_name()
                .map(|f| f.to_string_lossy() == n.as_str())
                .unwrap_or(false)
        });
        let probe_bad = kind == MediaKind::Video
            && normalizer.decide(file).await != crate::normalizer::NormalizeDecision::Passthrough;
        if named || probe_bad {
            incompatible.push(file.clone());
        } else {
            compatible.push(file.clone());
        }
    }

    // 无法定位不兼容条目：视频批全部延迟，图片批放弃
    if incompatible.is_empty() {
        if kind == MediaKind::Video {
            incompatible = std::mem::take(&mut compatible);
        } else {
            return Err(TaskError::Permanent {
                detail: "对端拒绝相册但无法定位不兼容条目".to_string(),
            });
        }
    }

    warn!(
        "相册被拒，二分重排: {} 个兼容 / {} 个不兼容 ({})",
        compatible.len(),
        incompatible.len(),
        archive_name
    );

    let mut followups = Vec::new();
    if !compatible.is_empty() {
        let mut requeued = ctx
            .engine
            .new_task(
                kind,
                TaskPayload::AlbumDispatch {
                    files: compatible.clone(),
                    kind,
                    archive_name: archive_name.to_string(),
                    batch_index: 1,
                    total_batches: 1,
                },
            )
            .with_source(task.source_ref)
            .with_cleanup(compatible);
        if let Some(ctx_archive) = task.archive.clone() {
            requeued = requeued.with_archive(ctx_archive);
        }
        followups.push(requeued);
    }
    for file in &incompatible {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        followups.push(defer_task(ctx, task, file, &file_name));
    }

    Ok(UploadResult::Split { followups })
}

/// 构造延迟转换任务
///
/// 源文件先移出解压根（解压根的生命周期由上传引用计数决定，
/// 不能被延迟转换占住），移动失败时保留原路径
fn defer_task(ctx: &AppContext, origin: &Task, input: &Path, file_name: &str) -> Task {
    let deferred_dir = ctx.work_dir().join("deferred");
    let input = match crate::fsutil::move_into_dir(input, &deferred_dir) {
        Ok(moved) => moved,
        Err(e) => {
            warn!("移动延迟转换源失败 {:?}: {}", input, e);
            input.to_path_buf()
        }
    };
    ctx.engine
        .new_task(
            MediaKind::Video,
            TaskPayload::DeferredConvert {
                input,
                file_name: file_name.to_string(),
            },
        )
        .with_source(origin.source_ref)
}
