//! 阶段工作线程
//!
//! 每个阶段一个（可配置 N 个）工作线程：取队首任务、执行、
//! 按结果走成功终态 / 重试 / 隔离。用户可见的失败提示只在
//! 失败分类首次出现时发送一条，分类变化才再次提示。
//!
//! 下载工作线程在任务之间观察准入闸门；执行中的任务不被闸门打断。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::engine::{Acquired, FailOutcome};
use crate::album::{AlbumBatch, AlbumBatcher};
use crate::cache;
use crate::context::AppContext;
use crate::error::{TaskError, TaskResult};
use crate::extractor::{ExtractorEvent, StreamingExtractor};
use crate::fetcher::Fetcher;
use crate::fsutil;
use crate::intake::kind_for_name;
use crate::normalizer::{NormalizeDecision, Normalizer};
use crate::task::{ArchiveContext, DownloadSource, MediaKind, Stage, Task, TaskPayload};
use crate::uploader::{self, UploadResult};
use crate::webdav::WebdavClient;

/// 延迟转换排水检查间隔
const DEFERRED_TICK: Duration = Duration::from_secs(5);

// ============================================================================
// 通用循环
// ============================================================================

/// 单阶段工作线程主循环
pub async fn run_stage_worker(ctx: Arc<AppContext>, stage: Stage, slot: usize) {
    info!("阶段 {} 工作线程 #{} 已启动", stage, slot);
    let fetcher = Fetcher::new(&ctx.config.fetch);

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        // 下载阶段在任务之间观察准入闸门
        if stage == Stage::Download {
            ctx.gate.wait_admitted(&ctx.cancel).await;
            if ctx.cancel.is_cancelled() {
                break;
            }
        }

        // 上传阶段在任务之间观察暂停开关（认证失效时挂起，
        // 凭证恢复钩子清除后继续）
        if stage == Stage::Upload {
            ctx.upload_pause.wait_resumed(&ctx.cancel).await;
            if ctx.cancel.is_cancelled() {
                break;
            }
        }

        let queue = ctx.engine.stage_queue(stage);
        match ctx.engine.acquire(stage) {
            Acquired::Task(task) => {
                debug!("阶段 {} 取到任务 {}: {}", stage, task.id, task.describe());
                let result = execute_task(&ctx, &fetcher, &task).await;
                finish_task(&ctx, task, result).await;
            }
            Acquired::Wait(delay) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = queue.notify.notified() => {}
                }
            }
            Acquired::Empty => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = queue.notify.notified() => {}
                }
            }
        }
    }
    info!("阶段 {} 工作线程 #{} 已退出", stage, slot);
}

/// 统一的结果收尾
async fn finish_task(ctx: &AppContext, task: Task, result: TaskResult<Vec<Task>>) {
    match result {
        Ok(followups) => {
            if let Err(e) = ctx.engine.complete(&task, followups) {
                error!("任务 {} 终态提交失败: {:#}", task.id, e);
            }
        }
        Err(TaskError::Canceled) => {
            // 关停或取消信号：任务留在日志里，下次恢复
            info!("任务 {} 被取消，归还队列", task.id);
            ctx.engine.release(&task);
        }
        Err(err) => {
            // 认证失效：挂起整个上传阶段，其余任务不再触碰失效凭证；
            // 凭证恢复钩子（auth:ok 信号或出站调用成功）清除暂停
            if matches!(err, TaskError::Auth { .. }) && ctx.upload_pause.pause() {
                warn!("检测到认证失效，上传阶段已挂起: {}", err);
                ctx.notifier
                    .notify(
                        task.source_ref,
                        "🔑 出站认证失效，上传已暂停；凭证恢复后发送 `auth:ok` 继续",
                    )
                    .await;
            }

            let first_of_class =
                task.last_error_class.as_deref() != Some(err.class_name());
            match ctx.engine.fail(&task, &err, &ctx.config.retry) {
                Ok(FailOutcome::Scheduled {
                    attempt,
                    max_attempts,
                    delay,
                }) => {
                    // 同一分类只提示第一次，避免刷屏
                    if first_of_class {
                        ctx.notifier
                            .notify(
                                task.source_ref,
                                &format!(
                                    "⚠️ {}：{} 秒后重试 (第 {}/{} 次)",
                                    err,
                                    delay.as_secs(),
                                    attempt,
                                    max_attempts
                                ),
                            )
                            .await;
                    }
                }
                Ok(FailOutcome::Quarantined) => {
                    ctx.notifier
                        .notify(
                            task.source_ref,
                            &format!("❌ 永久失败，已隔离待排查: {}", err),
                        )
                        .await;
                }
                Err(e) => error!("任务 {} 失败处理异常: {:#}", task.id, e),
            }
        }
    }
}

/// 按载荷分派执行
async fn execute_task(
    ctx: &AppContext,
    fetcher: &Fetcher,
    task: &Task,
) -> TaskResult<Vec<Task>> {
    match &task.payload {
        TaskPayload::Download { .. } => execute_download(ctx, fetcher, task).await,
        TaskPayload::WebdavCrawl { url } => execute_webdav_crawl(ctx, task, url).await,
        TaskPayload::WebdavFile { .. } => execute_webdav_file(ctx, task).await,
        TaskPayload::Extract { archive_path } => execute_extract(ctx, task, archive_path).await,
        TaskPayload::ExpandEntry { archive_path } => {
            execute_expand(ctx, task, archive_path).await
        }
        TaskPayload::Normalize { input, file_name } => {
            execute_normalize(ctx, task, input, file_name).await
        }
        TaskPayload::DeferredConvert { input, file_name } => {
            execute_enlist_deferred(ctx, task, input, file_name)
        }
        TaskPayload::AlbumDispatch { .. } | TaskPayload::DirectUpload { .. } => {
            execute_upload(ctx, task).await
        }
    }
}

// ============================================================================
// 下载阶段
// ============================================================================

/// 进度文本的周期刷新器
///
/// 下载回调只更新原子计数，独立循环负责节流后的消息编辑
struct ProgressTracker {
    written: Arc<std::sync::atomic::AtomicU64>,
    total: Arc<std::sync::atomic::AtomicU64>,
}

impl ProgressTracker {
    fn new() -> Self {
        Self {
            written: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            total: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    fn update(&self, written: u64, total: Option<u64>) {
        use std::sync::atomic::Ordering;
        self.written.store(written, Ordering::Relaxed);
        if let Some(total) = total {
            self.total.store(total, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        (
            self.written.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

async fn execute_download(
    ctx: &AppContext,
    fetcher: &Fetcher,
    task: &Task,
) -> TaskResult<Vec<Task>> {
    let (source, dest_dir, file_name) = match &task.payload {
        TaskPayload::Download {
            source,
            dest_dir,
            file_name,
            ..
        } => (source.clone(), dest_dir.clone(), file_name.clone()),
        _ => unreachable!(),
    };

    let dest = dest_dir.join(&file_name);
    let op_token = ctx.current_op.begin(&ctx.cancel);
    let reporter = ctx
        .notifier
        .progress_reporter(task.source_ref, &format!("⬇️ Downloading {}...", file_name))
        .await;

    let tracker = ProgressTracker::new();
    let t2 = ProgressTracker {
        written: tracker.written.clone(),
        total: tracker.total.clone(),
    };

    // 周期刷新进度消息（节流在 reporter 内部）
    let reporter = Arc::new(reporter);
    let reporter2 = reporter.clone();
    let name2 = file_name.clone();
    let ticker_cancel = op_token.child_token();
    let ticker_guard = ticker_cancel.clone();
    let ticker = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker_guard.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            let (written, total) = t2.snapshot();
            if total > 0 {
                let pct = (written * 100 / total).min(100) as u8;
                reporter2
                    .update(
                        pct,
                        &format!(
                            "⬇️ {} {}% ({} / {})",
                            name2,
                            pct,
                            fsutil::format_size(written),
                            fsutil::format_size(total)
                        ),
                    )
                    .await;
            }
        }
    });

    let fetch_result = match &source {
        DownloadSource::Attachment { file_id, .. } => {
            let cb: crate::messenger::ProgressFn = {
                let tracker = ProgressTracker {
                    written: tracker.written.clone(),
                    total: tracker.total.clone(),
                };
                Box::new(move |written, total| tracker.update(written, total))
            };
            ctx.messenger
                .fetch_attachment(file_id, &dest, &op_token, cb)
                .await
        }
        DownloadSource::Http { url } => fetcher
            .fetch(url, &dest, None, &op_token, |written, total| {
                tracker.update(written, total)
            })
            .await
            .map(|outcome| outcome.bytes),
    };

    ticker_cancel.cancel();
    ticker.abort();
    ctx.current_op.end();

    let bytes = match fetch_result {
        Ok(bytes) => bytes,
        Err(e) => {
            reporter.finish(&format!("⚠️ Download interrupted: {}", file_name)).await;
            return Err(e);
        }
    };

    reporter
        .finish(&format!(
            "✅ Download completed: {} ({})",
            file_name,
            fsutil::format_size(bytes)
        ))
        .await;

    route_downloaded(ctx, task, &dest, &file_name).await
}

/// 下载完成后的路由
///
/// 指纹去重在这里兜底（同内容重复提交最多产生一次上传）
async fn route_downloaded(
    ctx: &AppContext,
    task: &Task,
    path: &Path,
    file_name: &str,
) -> TaskResult<Vec<Task>> {
    let fingerprint = cache::fingerprint_file(path).map_err(|e| TaskError::Permanent {
        detail: format!("计算指纹失败: {:#}", e),
    })?;
    if ctx.cache.contains(&fingerprint) {
        info!("内容指纹命中缓存，跳过: {}", file_name);
        ctx.notifier
            .notify(task.source_ref, &format!("⏭️ 内容已处理过，跳过: {}", file_name))
            .await;
        fsutil::remove_file_quiet(path);
        return Ok(vec![]);
    }

    let kind = kind_for_name(file_name).unwrap_or(MediaKind::Document);
    let followup = match kind {
        MediaKind::Archive => ctx
            .engine
            .new_task(
                MediaKind::Archive,
                TaskPayload::Extract {
                    archive_path: path.to_path_buf(),
                },
            )
            .with_source(task.source_ref),
        MediaKind::Video => ctx
            .engine
            .new_task(
                MediaKind::Video,
                TaskPayload::Normalize {
                    input: path.to_path_buf(),
                    file_name: file_name.to_string(),
                },
            )
            .with_source(task.source_ref),
        kind => ctx
            .engine
            .new_task(
                kind,
                TaskPayload::DirectUpload {
                    file: path.to_path_buf(),
                    kind,
                    file_name: file_name.to_string(),
                },
            )
            .with_source(task.source_ref)
            .with_cleanup(vec![path.to_path_buf()]),
    };
    Ok(vec![followup])
}

async fn execute_webdav_crawl(
    ctx: &AppContext,
    task: &Task,
    url: &str,
) -> TaskResult<Vec<Task>> {
    if !ctx.config.webdav.enabled {
        return Err(TaskError::Permanent {
            detail: "WebDAV 支持未启用".to_string(),
        });
    }
    let client = WebdavClient::new(&ctx.config.webdav, &ctx.config.fetch);
    let files = client.walk_files(url).await?;

    let mut followups = Vec::new();
    for item in files {
        if kind_for_name(&item.name).is_none() {
            debug!("WebDAV 跳过不支持的文件: {}", item.name);
            continue;
        }
        let followup = ctx
            .engine
            .new_task(
                kind_for_name(&item.name).unwrap_or(MediaKind::Document),
                TaskPayload::WebdavFile {
                    remote_path: item.href.clone(),
                    dest_dir: ctx.work_dir().to_path_buf(),
                    file_name: item.name.clone(),
                    size: item.size,
                },
            )
            .with_source(task.source_ref);
        followups.push(followup);
    }

    ctx.notifier
        .notify(
            task.source_ref,
            &format!("📁 WebDAV 目录共发现 {} 个可用文件", followups.len()),
        )
        .await;
    Ok(followups)
}

async fn execute_webdav_file(ctx: &AppContext, task: &Task) -> TaskResult<Vec<Task>> {
    let (remote_path, dest_dir, file_name) = match &task.payload {
        TaskPayload::WebdavFile {
            remote_path,
            dest_dir,
            file_name,
            ..
        } => (remote_path.clone(), dest_dir.clone(), file_name.clone()),
        _ => unreachable!(),
    };

    let client = WebdavClient::new(&ctx.config.webdav, &ctx.config.fetch);
    let dest = dest_dir.join(&file_name);
    let op_token = ctx.current_op.begin(&ctx.cancel);
    let result = client
        .download(&remote_path, &dest, &op_token, |_, _| {})
        .await;
    ctx.current_op.end();
    result?;

    route_downloaded(ctx, task, &dest, &file_name).await
}

// ============================================================================
// 处理阶段
// ============================================================================

/// 压缩包名 -> 稳定的清单 ID / 解压根目录名
fn sanitize_archive_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

async fn execute_extract(
    ctx: &AppContext,
    task: &Task,
    archive_path: &Path,
) -> TaskResult<Vec<Task>> {
    if !archive_path.exists() {
        return Err(TaskError::Permanent {
            detail: format!("压缩包文件不存在: {:?}", archive_path),
        });
    }

    let archive_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let manifest_id = sanitize_archive_name(&archive_name);
    let extraction_root = ctx.work_dir().join("extracted").join(&manifest_id);
    let manifest_path = ctx.layout.manifest_path(&manifest_id);

    ctx.registry
        .register_extraction(archive_path, &extraction_root, &manifest_path);

    let followup = ctx
        .engine
        .new_task(
            MediaKind::Archive,
            TaskPayload::ExpandEntry {
                archive_path: archive_path.to_path_buf(),
            },
        )
        .with_source(task.source_ref)
        .with_archive(ArchiveContext {
            archive_name,
            extraction_root,
            manifest_id,
        });
    Ok(vec![followup])
}

async fn execute_expand(
    ctx: &AppContext,
    task: &Task,
    archive_path: &Path,
) -> TaskResult<Vec<Task>> {
    let archive_ctx = task.archive.clone().ok_or(TaskError::Permanent {
        detail: "展开任务缺少压缩包上下文".to_string(),
    })?;

    // 背压事件转发给用户
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ExtractorEvent>();
    {
        let notifier_source = task.source_ref;
        let ctx_notify = ctx.notifier.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let text = match event {
                    ExtractorEvent::LowSpacePause {
                        required,
                        available,
                    } => format!(
                        "⚠️ 磁盘空间不足（剩余 {}，需要 {}），解压已暂停",
                        fsutil::format_size(available),
                        fsutil::format_size(required)
                    ),
                    ExtractorEvent::SpaceRecovered => {
                        "✅ 磁盘空间恢复，继续解压".to_string()
                    }
                };
                ctx_notify.notify(notifier_source, &text).await;
            }
        });
    }

    let mut extractor = StreamingExtractor::open(
        archive_path.to_path_buf(),
        archive_ctx.extraction_root.clone(),
        ctx.layout.manifest_path(&archive_ctx.manifest_id),
        ctx.config.storage.free_space_floor(),
        Some(event_tx),
    )
    .await
    .map_err(|e| TaskError::Permanent {
        detail: format!("打开压缩包失败: {:#}", e),
    })?;

    // 密码保护：阻塞等待密钥送达
    if extractor.needs_secret() {
        ctx.notifier
            .notify(
                task.source_ref,
                &format!(
                    "🔒 压缩包需要密码: {}\n发送 `secret:<密码>` 继续",
                    extractor.archive_name()
                ),
            )
            .await;
        let secret = ctx
            .secret_gate
            .wait_for_secret(extractor.archive_name(), &ctx.cancel)
            .await?;
        extractor.set_secret(secret);
    }

    let op_token = ctx.current_op.begin(&ctx.cancel);
    let result = expand_loop(ctx, task, &archive_ctx, &mut extractor, &op_token).await;
    ctx.current_op.end();
    result
}

/// 展开主循环：逐条目解出 -> 归一化 -> 分批 -> 入队
async fn expand_loop(
    ctx: &AppContext,
    task: &Task,
    archive_ctx: &ArchiveContext,
    extractor: &mut StreamingExtractor,
    op_token: &tokio_util::sync::CancellationToken,
) -> TaskResult<Vec<Task>> {
    let normalizer = Normalizer::new(&ctx.config.transcode);
    let mut batcher = AlbumBatcher::new(
        archive_ctx.archive_name.clone(),
        ctx.config.album.size_cap,
    );
    let (images, videos) = extractor.totals_by_kind();
    batcher.set_expected(images, videos);

    let total = extractor.manifest().total_entries();
    let reporter = ctx
        .notifier
        .progress_reporter(
            task.source_ref,
            &format!(
                "📦 Extracting {} ({} media entries)...",
                archive_ctx.archive_name, total
            ),
        )
        .await;

    // 批内文件 -> 条目名（批入队后按名确认清单）
    let mut pending_names: Vec<(PathBuf, String)> = Vec::new();
    let mut processed = extractor.manifest().processed_count();

    while let Some(entry) = extractor.next_entry(op_token).await? {
        let mut path = entry.temp_path.clone();
        let mut kind = entry.kind;

        // 每个条目经过归一化判定
        if kind == MediaKind::Video {
            match normalizer.decide(&path).await {
                NormalizeDecision::Passthrough => {}
                NormalizeDecision::Inline => {
                    let output = path.with_extension("normalized.mp4");
                    match normalizer
                        .normalize(&path, &output, op_token, None::<fn(u8)>)
                        .await
                    {
                        Ok(converted) => {
                            fsutil::remove_file_quiet(&path);
                            path = converted;
                        }
                        Err(TaskError::Canceled) => return Err(TaskError::Canceled),
                        Err(e) => {
                            // 内联转换失败时按原件上传
                            warn!("内联转换失败，按原件上传 {}: {}", entry.entry_name, e);
                        }
                    }
                }
                NormalizeDecision::Defer => {
                    // 移出解压根，不占住根目录的生命周期
                    let deferred_dir = ctx.work_dir().join("deferred");
                    let moved = fsutil::move_into_dir(&path, &deferred_dir).map_err(|e| {
                        TaskError::Permanent {
                            detail: format!("移动延迟转换源失败: {}", e),
                        }
                    })?;
                    let output = uploader_output_path(&moved);
                    ctx.ledger
                        .enlist(
                            &moved,
                            &output,
                            &entry.entry_name,
                            task.source_ref,
                        )
                        .map_err(|e| TaskError::Permanent {
                            detail: format!("登记延迟转换失败: {:#}", e),
                        })?;
                    extractor.acknowledge(&entry.entry_name).ok();
                    processed += 1;
                    continue;
                }
            }
            kind = MediaKind::Video;
        }

        pending_names.push((path.clone(), entry.entry_name.clone()));
        if let Some(batch) = batcher.push(path, kind) {
            let acked = batch_entry_names(&batch, &pending_names);
            enqueue_batch(ctx, task, archive_ctx, &batch, &mut pending_names)?;
            for name in acked {
                extractor.acknowledge(&name).ok();
            }
        }

        processed += 1;
        if total > 0 {
            let pct = (processed * 100 / total).min(100) as u8;
            reporter
                .update(
                    pct,
                    &format!(
                        "📦 {} {}/{} entries",
                        archive_ctx.archive_name, processed, total
                    ),
                )
                .await;
        }
    }

    // 流结束：尾批封口
    for batch in batcher.flush() {
        let acked = batch_entry_names(&batch, &pending_names);
        enqueue_batch(ctx, task, archive_ctx, &batch, &mut pending_names)?;
        for name in acked {
            extractor.acknowledge(&name).ok();
        }
    }

    reporter
        .finish(&format!(
            "✅ Extraction queued: {} ({} entries)",
            archive_ctx.archive_name, processed
        ))
        .await;
    Ok(vec![])
}

/// 批内文件对应的条目名
fn batch_entry_names(batch: &AlbumBatch, pending: &[(PathBuf, String)]) -> Vec<String> {
    batch
        .files
        .iter()
        .filter_map(|f| {
            pending
                .iter()
                .find(|(path, _)| path == f)
                .map(|(_, name)| name.clone())
        })
        .collect()
}

/// 封口的批 -> 相册任务入队（引用计数同步递增）
fn enqueue_batch(
    ctx: &AppContext,
    task: &Task,
    archive_ctx: &ArchiveContext,
    batch: &AlbumBatch,
    pending_names: &mut Vec<(PathBuf, String)>,
) -> TaskResult<()> {
    let album_task = ctx
        .engine
        .new_task(
            batch.kind,
            TaskPayload::AlbumDispatch {
                files: batch.files.clone(),
                kind: batch.kind,
                archive_name: batch.archive_name.clone(),
                batch_index: batch.batch_index,
                total_batches: batch.total_batches,
            },
        )
        .with_source(task.source_ref)
        .with_archive(archive_ctx.clone())
        .with_cleanup(batch.files.clone());

    ctx.registry.add_refs(&archive_ctx.extraction_root, 1);
    ctx.engine
        .enqueue(album_task)
        .map_err(|e| TaskError::Permanent {
            detail: format!("相册任务入队失败: {:#}", e),
        })?;

    // 已入队的文件移出待确认集合
    pending_names.retain(|(path, _)| !batch.files.contains(path));
    Ok(())
}

/// 转换输出路径：`<stem>_converted.mp4`
fn uploader_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    input.with_file_name(format!("{}_converted.mp4", stem))
}

async fn execute_normalize(
    ctx: &AppContext,
    task: &Task,
    input: &Path,
    file_name: &str,
) -> TaskResult<Vec<Task>> {
    if !input.exists() {
        return Err(TaskError::Permanent {
            detail: format!("归一化输入不存在: {:?}", input),
        });
    }

    let normalizer = Normalizer::new(&ctx.config.transcode);
    match normalizer.decide(input).await {
        NormalizeDecision::Passthrough => {
            let followup = ctx
                .engine
                .new_task(
                    MediaKind::Video,
                    TaskPayload::DirectUpload {
                        file: input.to_path_buf(),
                        kind: MediaKind::Video,
                        file_name: file_name.to_string(),
                    },
                )
                .with_source(task.source_ref)
                .with_cleanup(vec![input.to_path_buf()]);
            Ok(vec![followup])
        }
        NormalizeDecision::Inline => {
            let output = uploader_output_path(input);
            let op_token = ctx.current_op.begin(&ctx.cancel);
            let result = normalizer
                .normalize(input, &output, &op_token, None::<fn(u8)>)
                .await;
            ctx.current_op.end();
            let converted = result?;

            let followup = ctx
                .engine
                .new_task(
                    MediaKind::Video,
                    TaskPayload::DirectUpload {
                        file: converted.clone(),
                        kind: MediaKind::Video,
                        file_name: file_name.to_string(),
                    },
                )
                .with_source(task.source_ref)
                .with_cleanup(vec![input.to_path_buf(), converted]);
            Ok(vec![followup])
        }
        NormalizeDecision::Defer => {
            execute_enlist_deferred(ctx, task, input, file_name)
        }
    }
}

/// 写入延迟转换账本（DeferredConvert 任务与归一化 Defer 共用）
fn execute_enlist_deferred(
    ctx: &AppContext,
    task: &Task,
    input: &Path,
    file_name: &str,
) -> TaskResult<Vec<Task>> {
    if !input.exists() {
        return Err(TaskError::Permanent {
            detail: format!("延迟转换源不存在: {:?}", input),
        });
    }
    let output = uploader_output_path(input);
    ctx.ledger
        .enlist(input, &output, file_name, task.source_ref)
        .map_err(|e| TaskError::Permanent {
            detail: format!("登记延迟转换失败: {:#}", e),
        })?;
    Ok(vec![])
}

// ============================================================================
// 上传阶段
// ============================================================================

async fn execute_upload(ctx: &AppContext, task: &Task) -> TaskResult<Vec<Task>> {
    match uploader::execute(ctx, task).await? {
        UploadResult::Sent { substitutes } => {
            // 指纹入缓存（删除之前计算）
            let sent_files: Vec<PathBuf> = match &task.payload {
                TaskPayload::AlbumDispatch { files, .. } => files.clone(),
                TaskPayload::DirectUpload { file, .. } => vec![file.clone()],
                _ => vec![],
            };
            for file in sent_files.iter().filter(|f| f.exists()) {
                if let Ok(fingerprint) = cache::fingerprint_file(file) {
                    let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                    let name = file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if let Err(e) = ctx.cache.insert(fingerprint, name, size) {
                        warn!("缓存插入失败: {:#}", e);
                    }
                }
            }

            // 成功终态：删除清理引用与中间产物
            fsutil::remove_all_quiet(&task.cleanup_refs);
            fsutil::remove_all_quiet(&substitutes);

            // 解压根引用计数递减
            if let Some(ref archive) = task.archive {
                ctx.registry.release_ref(&archive.extraction_root);
            }

            ctx.notifier
                .notify(task.source_ref, &format!("✅ 已发送: {}", task.describe()))
                .await;
            Ok(vec![])
        }
        UploadResult::Split { followups } => {
            // 先为引用解压根的后继任务补引用，再释放原任务的引用，
            // 避免计数瞬间归零触发误清理
            if let Some(ref archive) = task.archive {
                let upload_followups = followups
                    .iter()
                    .filter(|t| t.stage() == Stage::Upload && t.archive.is_some())
                    .count();
                if upload_followups > 0 {
                    ctx.registry
                        .add_refs(&archive.extraction_root, upload_followups);
                }
                ctx.registry.release_ref(&archive.extraction_root);
            }
            Ok(followups)
        }
    }
}

// ============================================================================
// 延迟转换工作线程
// ============================================================================

/// 延迟转换排水线程
///
/// 饥饿安全：只有下载与上传队列都没有非延迟工作时才转换；
/// 期间每个账本写入节奏落盘一次进度
pub async fn run_deferred_worker(ctx: Arc<AppContext>) {
    info!("延迟转换工作线程已启动");
    let normalizer = Normalizer::new(&ctx.config.transcode);
    let mut sweep_counter = 0u32;

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(DEFERRED_TICK) => {}
        }

        // 周期清扫过期的已完成条目
        sweep_counter += 1;
        if sweep_counter >= 60 {
            sweep_counter = 0;
            ctx.ledger
                .sweep_completed(ctx.config.conversion.completed_ttl_hours)
                .ok();
        }

        // 高优先级队列有工作时让路
        if !ctx.engine.all_stages_idle() {
            continue;
        }
        let entry = match ctx.ledger.next_pending() {
            Some(entry) => entry,
            None => continue,
        };
        // 取出后再次确认没有新工作插进来
        if !ctx.engine.all_stages_idle() {
            continue;
        }

        if !entry.input_path.exists() {
            warn!("延迟转换源已消失: {:?}", entry.input_path);
            ctx.ledger
                .record_failure(&entry.input_path, "源文件缺失")
                .ok();
            continue;
        }

        info!("开始延迟转换: {}", entry.file_name);
        if ctx.ledger.mark_in_progress(&entry.input_path).is_err() {
            continue;
        }

        let op_token = ctx.current_op.begin(&ctx.cancel);
        let ledger = ctx.ledger.clone();
        let input = entry.input_path.clone();
        let progress = move |pct: u8| {
            ledger.update_progress(&input, pct);
        };
        let result = normalizer
            .normalize(&entry.input_path, &entry.output_path, &op_token, Some(progress))
            .await;
        ctx.current_op.end();

        match result {
            Ok(output) => {
                ctx.ledger.mark_completed(&entry.input_path).ok();
                info!("延迟转换完成: {}", entry.file_name);

                let upload = ctx
                    .engine
                    .new_task(
                        MediaKind::Video,
                        TaskPayload::DirectUpload {
                            file: output.clone(),
                            kind: MediaKind::Video,
                            file_name: entry.file_name.clone(),
                        },
                    )
                    .with_source(entry.source_ref)
                    .with_cleanup(vec![entry.input_path.clone(), output]);
                if let Err(e) = ctx.engine.enqueue(upload) {
                    error!("转换产物上传任务入队失败: {:#}", e);
                }
            }
            Err(TaskError::Canceled) => {
                // 保持 in_progress，重启后按账本规则重排
                info!("延迟转换被取消: {}", entry.file_name);
            }
            Err(e) => {
                warn!("延迟转换失败: {} ({})", entry.file_name, e);
                match ctx.ledger.record_failure(&entry.input_path, &e.to_string()) {
                    Ok(true) => {}
                    Ok(false) => {
                        // 预算耗尽：源文件移入隔离区
                        ctx.notifier
                            .notify(
                                entry.source_ref,
                                &format!("❌ 视频转换最终失败，已隔离: {}", entry.file_name),
                            )
                            .await;
                        fsutil::move_into_dir(
                            &entry.input_path,
                            &ctx.layout.quarantine_dir(),
                        )
                        .ok();
                    }
                    Err(e) => error!("账本失败记录异常: {:#}", e),
                }
            }
        }
    }
    info!("延迟转换工作线程已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::cleanup::CleanupRegistry;
    use crate::config::AppConfig;
    use crate::conversion::ConversionLedger;
    use crate::extractor::SecretGate;
    use crate::messenger::testing::MockMessenger;
    use crate::messenger::Notifier;
    use crate::queue::QueueEngine;
    use crate::supervisor::{AdmissionGate, CurrentOp, PauseSwitch};
    use crate::{context::StorageLayout, supervisor};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_sanitize_archive_name() {
        assert_eq!(sanitize_archive_name("My Photos.zip"), "My_Photos.zip");
        assert_eq!(sanitize_archive_name("a/b\\c.zip"), "a_b_c.zip");
        assert_eq!(sanitize_archive_name("中文包.zip"), "中文包.zip");
    }

    #[test]
    fn test_uploader_output_path() {
        assert_eq!(
            uploader_output_path(Path::new("/d/clip.avi")),
            PathBuf::from("/d/clip_converted.mp4")
        );
    }

    /// 组装带内存消息替身的完整上下文
    fn build_ctx(temp: &TempDir) -> (Arc<AppContext>, Arc<MockMessenger>) {
        let mut config: AppConfig = toml::from_str(
            r#"
[messenger]
bot_token = "123:abc"
target = "@receiver"
"#,
        )
        .unwrap();
        config.normalize();
        config.storage.data_dir = temp.path().join("data");
        config.storage.work_dir = temp.path().join("data/work");

        let layout = StorageLayout::from(&config);
        layout.prepare().unwrap();

        let engine = Arc::new(
            QueueEngine::open(&layout, config.queue.compact_threshold, config.album.size_cap)
                .unwrap(),
        );
        let cache = Arc::new(ContentCache::load(layout.cache_path()));
        let ledger = Arc::new(ConversionLedger::load(
            layout.conversions_path(),
            config.conversion.state_save_interval_secs,
            config.conversion.max_retries,
        ));
        let registry = Arc::new(CleanupRegistry::new());

        let mock = Arc::new(MockMessenger::new());
        let messenger: Arc<dyn crate::messenger::Messenger> = mock.clone();
        let notifier = Arc::new(Notifier::new(messenger.clone(), 5, 7));

        let ctx = Arc::new(AppContext {
            gate: AdmissionGate::new(true),
            upload_pause: PauseSwitch::new(),
            secret_gate: Arc::new(SecretGate::new()),
            current_op: Arc::new(CurrentOp::new()),
            cancel: CancellationToken::new(),
            config,
            layout,
            engine,
            cache,
            registry,
            ledger,
            messenger,
            notifier,
        });
        (ctx, mock)
    }

    fn album_task_with_files(
        ctx: &AppContext,
        dir: &Path,
        count: usize,
    ) -> (Task, Vec<PathBuf>, ArchiveContext) {
        let root = dir.join("extracted").join("A.zip");
        std::fs::create_dir_all(&root).unwrap();
        let files: Vec<PathBuf> = (0..count)
            .map(|i| {
                let path = root.join(format!("{:02}.jpg", i));
                std::fs::write(&path, format!("image-{}", i)).unwrap();
                path
            })
            .collect();

        let archive_ctx = ArchiveContext {
            archive_name: "A.zip".to_string(),
            extraction_root: root,
            manifest_id: "A.zip".to_string(),
        };
        let task = ctx
            .engine
            .new_task(
                MediaKind::Image,
                TaskPayload::AlbumDispatch {
                    files: files.clone(),
                    kind: MediaKind::Image,
                    archive_name: "A.zip".to_string(),
                    batch_index: 1,
                    total_batches: 1,
                },
            )
            .with_source(Some(77))
            .with_archive(archive_ctx.clone())
            .with_cleanup(files.clone());
        (task, files, archive_ctx)
    }

    #[tokio::test]
    async fn test_album_success_cleans_and_caches() {
        let temp = TempDir::new().unwrap();
        let (ctx, mock) = build_ctx(&temp);
        let (task, files, archive_ctx) = album_task_with_files(&ctx, ctx.work_dir(), 10);

        ctx.registry.add_refs(&archive_ctx.extraction_root, 1);

        let followups = execute_upload(&ctx, &task).await.unwrap();
        assert!(followups.is_empty());
        assert_eq!(mock.sent_albums(), 1);

        // 十个文件全部删除，每个文件一条缓存记录
        for file in &files {
            assert!(!file.exists(), "{:?} 应已清理", file);
        }
        assert_eq!(ctx.cache.len(), 10);

        // 引用计数归零：解压根被移除
        assert!(!archive_ctx.extraction_root.exists());
    }

    #[tokio::test]
    async fn test_flood_wait_preserves_files_and_budget() {
        // 十图相册首次发送即限流 1678 秒
        let temp = TempDir::new().unwrap();
        let (ctx, mock) = build_ctx(&temp);
        let (task, files, _) = album_task_with_files(&ctx, ctx.work_dir(), 10);
        ctx.engine.enqueue(task.clone()).unwrap();
        let acquired = match ctx.engine.acquire(Stage::Upload) {
            Acquired::Task(t) => t,
            other => panic!("{:?}", other),
        };

        mock.push_album_result(Some(TaskError::RateLimit { wait_secs: 1678 }));
        let result = execute_task(&ctx, &Fetcher::new(&ctx.config.fetch), &acquired).await;
        let err = result.unwrap_err();
        assert_eq!(err, TaskError::RateLimit { wait_secs: 1678 });

        // 失败处理：不删文件、不消耗预算、等待严格 1678 秒
        match ctx.engine.fail(&acquired, &err, &ctx.config.retry).unwrap() {
            FailOutcome::Scheduled { delay, .. } => {
                assert_eq!(delay.as_secs(), 1678);
            }
            other => panic!("{:?}", other),
        }
        for file in &files {
            assert!(file.exists(), "限流期间不允许删除文件");
        }
        let mut stashed = Vec::new();
        ctx.engine.retry.for_each(|t| stashed.push(t.clone()));
        assert_eq!(stashed.len(), 1);
        assert_eq!(stashed[0].retry_count, 0);
        let eta = stashed[0].next_attempt_at.unwrap();
        let delta = (eta - chrono::Utc::now()).num_seconds();
        assert!((1670..=1678).contains(&delta), "delta={}", delta);

        // 重试泵不会提前搬运
        assert_eq!(ctx.engine.promote_due_retries().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_pauses_upload_stage() {
        // 认证失效必须挂起上传阶段，由凭证恢复钩子清除
        let temp = TempDir::new().unwrap();
        let (ctx, mock) = build_ctx(&temp);
        let (task, files, _) = album_task_with_files(&ctx, ctx.work_dir(), 3);
        ctx.engine.enqueue(task).unwrap();
        let acquired = match ctx.engine.acquire(Stage::Upload) {
            Acquired::Task(t) => t,
            other => panic!("{:?}", other),
        };

        mock.push_album_result(Some(TaskError::Auth {
            detail: "Unauthorized".into(),
        }));
        let result = execute_task(&ctx, &Fetcher::new(&ctx.config.fetch), &acquired).await;
        finish_task(&ctx, acquired, result).await;

        // 上传阶段挂起，任务与文件完好保留在重试日志中
        assert!(ctx.upload_pause.is_paused());
        assert_eq!(ctx.engine.retry.len(), 1);
        let mut stashed = Vec::new();
        ctx.engine.retry.for_each(|t| stashed.push(t.clone()));
        assert_eq!(stashed[0].retry_count, 0, "认证失效不消耗预算");
        for file in &files {
            assert!(file.exists());
        }

        // 任务立即重排就绪，但被挂起的工作线程不会触碰
        assert_eq!(ctx.engine.promote_due_retries().unwrap(), 1);
        assert!(ctx.upload_pause.is_paused());

        // 适配器钩子清除暂停
        assert!(ctx.upload_pause.resume());
        assert!(!ctx.upload_pause.is_paused());
    }

    #[tokio::test]
    async fn test_download_routes_archive_to_extract() {
        let temp = TempDir::new().unwrap();
        let (ctx, _mock) = build_ctx(&temp);

        let task = ctx
            .engine
            .new_task(
                MediaKind::Archive,
                TaskPayload::Download {
                    source: DownloadSource::Attachment {
                        file_id: "F1".to_string(),
                        chat_id: 1,
                        message_id: 77,
                    },
                    dest_dir: ctx.work_dir().to_path_buf(),
                    file_name: "pack.zip".to_string(),
                    expected_size: None,
                },
            )
            .with_source(Some(77));

        // MockMessenger 的 fetch_attachment 会写出文件
        let followups = execute_download(&ctx, &Fetcher::new(&ctx.config.fetch), &task)
            .await
            .unwrap();
        assert_eq!(followups.len(), 1);
        assert!(matches!(
            followups[0].payload,
            TaskPayload::Extract { .. }
        ));
        assert!(ctx.work_dir().join("pack.zip").exists());
    }

    #[tokio::test]
    async fn test_duplicate_fingerprint_skipped() {
        // 同一内容的事件第二次提交不再产生上传
        let temp = TempDir::new().unwrap();
        let (ctx, _mock) = build_ctx(&temp);

        let make_task = |name: &str| {
            ctx.engine
                .new_task(
                    MediaKind::Image,
                    TaskPayload::Download {
                        source: DownloadSource::Attachment {
                            file_id: "F1".to_string(),
                            chat_id: 1,
                            message_id: 1,
                        },
                        dest_dir: ctx.work_dir().to_path_buf(),
                        file_name: name.to_string(),
                        expected_size: None,
                    },
                )
        };

        let fetcher = Fetcher::new(&ctx.config.fetch);
        let first = execute_download(&ctx, &fetcher, &make_task("a.jpg")).await.unwrap();
        assert_eq!(first.len(), 1);

        // 指纹入缓存（模拟上传成功后的插入）
        let fp = cache::fingerprint_file(&ctx.work_dir().join("a.jpg")).unwrap();
        ctx.cache.insert(fp, "a.jpg".to_string(), 16).unwrap();

        // 相同内容再来一次：无后继任务，文件被清理
        let second = execute_download(&ctx, &fetcher, &make_task("b.jpg")).await.unwrap();
        assert!(second.is_empty());
        assert!(!ctx.work_dir().join("b.jpg").exists());
    }

    #[tokio::test]
    async fn test_extract_registers_and_chains_expand() {
        let temp = TempDir::new().unwrap();
        let (ctx, _mock) = build_ctx(&temp);

        let archive_path = ctx.work_dir().join("A.zip");
        std::fs::write(&archive_path, b"zipbytes").unwrap();

        let task = ctx.engine.new_task(
            MediaKind::Archive,
            TaskPayload::Extract {
                archive_path: archive_path.clone(),
            },
        );
        let followups = execute_extract(&ctx, &task, &archive_path).await.unwrap();
        assert_eq!(followups.len(), 1);

        let expand = &followups[0];
        assert!(matches!(expand.payload, TaskPayload::ExpandEntry { .. }));
        let archive_ctx = expand.archive.as_ref().unwrap();
        assert_eq!(archive_ctx.archive_name, "A.zip");
        assert_eq!(archive_ctx.manifest_id, "A.zip");
    }

    #[tokio::test]
    async fn test_deferred_worker_gated_on_idle_queues() {
        // 下载/上传存在非延迟工作时，账本不应被排水
        let temp = TempDir::new().unwrap();
        let (ctx, _mock) = build_ctx(&temp);

        let source = ctx.work_dir().join("clip.avi");
        std::fs::write(&source, b"video-bytes").unwrap();
        ctx.ledger
            .enlist(&source, &ctx.work_dir().join("clip.mp4"), "clip.avi", None)
            .unwrap();

        // 队列里放一个未完成的下载任务
        let blocker = ctx.engine.new_task(
            MediaKind::Image,
            TaskPayload::Download {
                source: DownloadSource::Http {
                    url: "https://cdn.example/x.jpg".to_string(),
                },
                dest_dir: ctx.work_dir().to_path_buf(),
                file_name: "x.jpg".to_string(),
                expected_size: None,
            },
        );
        ctx.engine.enqueue(blocker).unwrap();

        assert!(!ctx.engine.all_stages_idle());
        assert!(ctx.ledger.has_pending());

        // 队列清空后才满足排水条件
        let acquired = match ctx.engine.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            other => panic!("{:?}", other),
        };
        ctx.engine.complete(&acquired, vec![]).unwrap();
        assert!(ctx.engine.all_stages_idle());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_refcounts() {
        // 重启后引用计数必须等于引用该根的未完成上传任务数
        let temp = TempDir::new().unwrap();
        let root;
        {
            let (ctx, _mock) = build_ctx(&temp);
            let (task, _files, archive_ctx) = album_task_with_files(&ctx, ctx.work_dir(), 4);
            root = archive_ctx.extraction_root.clone();
            ctx.engine.enqueue(task).unwrap();
            // 崩溃：不执行
        }

        let (ctx, _mock) = build_ctx(&temp);
        supervisor::restore_state(&ctx).unwrap();
        assert_eq!(ctx.registry.ref_count(&root), 1);
    }
}
