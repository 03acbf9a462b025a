//! 进程监督者
//!
//! 单例锁、崩溃状态快照、启动恢复编排、准入闸门与关停路径。
//! 快照仅供运维观察，权威状态永远是阶段日志。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::extractor::scan_manifests;

// ============================================================================
// 单例锁
// ============================================================================

/// 另一实例已在运行时的退出码
pub const EXIT_CODE_ALREADY_RUNNING: i32 = 3;

/// 单例锁持有者
///
/// Drop 时移除锁文件（正常关停路径）
pub struct SingletonLock {
    path: PathBuf,
}

/// 单例锁获取失败
#[derive(Debug)]
pub enum LockError {
    /// 另一实例存活（携带其 pid）
    AlreadyRunning(u32),
    /// IO 失败
    Io(std::io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::AlreadyRunning(pid) => {
                write!(f, "另一实例已在运行 (PID {})", pid)
            }
            LockError::Io(e) => write!(f, "锁文件操作失败: {}", e),
        }
    }
}

impl std::error::Error for LockError {}

/// pid 是否存活
fn pid_is_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // 无法探测时按存活处理，避免抢占
        let _ = pid;
        true
    }
}

impl SingletonLock {
    /// 获取单例锁
    ///
    /// 锁文件存在且 pid 存活则失败；pid 已死则回收陈旧锁
    pub fn acquire(path: &Path) -> std::result::Result<Self, LockError> {
        if path.exists() {
            let existing_pid = std::fs::read_to_string(path)
                .ok()
                .and_then(|content| content.trim().parse::<u32>().ok());

            match existing_pid {
                Some(pid) if pid_is_running(pid) => {
                    return Err(LockError::AlreadyRunning(pid));
                }
                _ => {
                    warn!("回收陈旧的单例锁: {:?}", path);
                    std::fs::remove_file(path).map_err(LockError::Io)?;
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(LockError::Io)?;
        }

        // O_EXCL 创建，竞争时失败
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        let file = options.open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                LockError::AlreadyRunning(0)
            } else {
                LockError::Io(e)
            }
        })?;

        use std::io::Write;
        let mut file = file;
        write!(file, "{}", std::process::id()).map_err(LockError::Io)?;

        info!("已获取单例锁: {:?} (PID {})", path, std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("移除单例锁失败: {}", e);
            }
        } else {
            info!("已移除单例锁");
        }
    }
}

// ============================================================================
// 准入闸门
// ============================================================================

/// 下载准入闸门
///
/// 外部网络状态信号切换；下载工作线程在任务之间观察闸门，
/// 进行中的下载自然完成不被打断
#[derive(Clone)]
pub struct AdmissionGate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl AdmissionGate {
    pub fn new(initially_admitted: bool) -> Self {
        let (tx, rx) = watch::channel(initially_admitted);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn set_admitted(&self, admitted: bool) {
        self.tx.send_replace(admitted);
    }

    pub fn is_admitted(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待闸门开启
    pub async fn wait_admitted(&self, cancel: &CancellationToken) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            debug!("下载准入关闭，等待开启");
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = rx.changed() => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// ============================================================================
// 上传暂停开关
// ============================================================================

/// 上传工作线程的暂停开关
///
/// 认证失效时挂起上传阶段：工作线程在任务之间观察开关，
/// 由适配器钩子（凭证恢复信号）清除后继续。暂停期间任务
/// 停留在重试日志里，不再触碰失效的凭证。
#[derive(Clone)]
pub struct PauseSwitch {
    paused: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl PauseSwitch {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// 挂起；返回是否由运行态切换到暂停态
    pub fn pause(&self) -> bool {
        !self
            .paused
            .swap(true, std::sync::atomic::Ordering::SeqCst)
    }

    /// 清除暂停（适配器钩子调用）；返回是否确有暂停被清除
    pub fn resume(&self) -> bool {
        let was_paused = self
            .paused
            .swap(false, std::sync::atomic::Ordering::SeqCst);
        if was_paused {
            self.notify.notify_waiters();
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// 等待恢复运行
    pub async fn wait_resumed(&self, cancel: &CancellationToken) {
        loop {
            // 先建立等待句柄再检查，避免恢复通知丢失
            let notified = self.notify.notified();
            if !self.is_paused() {
                return;
            }
            debug!("上传已暂停，等待凭证恢复");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }
}

impl Default for PauseSwitch {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 当前操作取消
// ============================================================================

/// 当前长操作的取消句柄登记处
///
/// 取消信号只作用于登记中的操作，任务本身留在日志里重试
pub struct CurrentOp {
    active: Mutex<Option<CancellationToken>>,
}

impl CurrentOp {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// 登记一个长操作，返回其取消令牌（根令牌的子令牌）
    pub fn begin(&self, root: &CancellationToken) -> CancellationToken {
        let token = root.child_token();
        *self.active.lock() = Some(token.clone());
        token
    }

    /// 操作结束，撤销登记
    pub fn end(&self) {
        *self.active.lock() = None;
    }

    /// 取消当前登记的操作；返回是否有操作被取消
    pub fn cancel_active(&self) -> bool {
        match self.active.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for CurrentOp {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 快照
// ============================================================================

/// 咨询性快照（state/current.json）
#[derive(Debug, Serialize)]
struct Snapshot {
    written_at: DateTime<Utc>,
    download_pending: usize,
    process_pending: usize,
    upload_pending: usize,
    retry_pending: usize,
    in_flight: Vec<String>,
    admission_open: bool,
    upload_paused: bool,
}

/// 写入一次快照
fn write_snapshot(ctx: &AppContext) -> Result<()> {
    let status = ctx.engine.status();
    let snapshot = Snapshot {
        written_at: Utc::now(),
        download_pending: status.download_pending,
        process_pending: status.process_pending,
        upload_pending: status.upload_pending,
        retry_pending: status.retry_pending,
        in_flight: status.in_flight,
        admission_open: ctx.gate.is_admitted(),
        upload_paused: ctx.upload_pause.is_paused(),
    };
    let path = ctx.layout.snapshot_path();
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&snapshot)?)
        .context("写入快照临时文件失败")?;
    std::fs::rename(&tmp, &path).context("快照原子替换失败")?;
    Ok(())
}

/// 快照循环：每隔配置间隔写一次
pub async fn run_snapshot_loop(ctx: Arc<AppContext>) {
    let interval = Duration::from_secs(ctx.config.storage.snapshot_interval_secs.max(1));
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = write_snapshot(&ctx) {
            warn!("快照写入失败: {:#}", e);
        }
    }
    debug!("快照循环已退出");
}

/// 重试泵：周期把到期的重试任务搬回目标阶段
pub async fn run_retry_pump(ctx: Arc<AppContext>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        match ctx.engine.promote_due_retries() {
            Ok(0) => {}
            Ok(n) => debug!("重试泵搬运 {} 个到期任务", n),
            Err(e) => error!("重试泵失败: {:#}", e),
        }
    }
    debug!("重试泵已退出");
}

// ============================================================================
// 恢复编排
// ============================================================================

/// 启动恢复
///
/// 阶段日志回放与相册重组在引擎打开时已完成；这里补齐：
/// 1. 按清单重新登记解压上下文（压缩包注册表）
/// 2. 扫描恢复的队列重建引用计数
/// 3. 延迟转换账本的启动扫描
pub fn restore_state(ctx: &AppContext) -> Result<()> {
    // 1. 清单 -> 压缩包注册表
    let manifests = scan_manifests(&ctx.layout.manifests_dir());
    for (id, data) in &manifests {
        ctx.registry.register_extraction(
            &data.archive_path,
            &data.extraction_root,
            &ctx.layout.manifest_path(id),
        );
    }
    if !manifests.is_empty() {
        info!("恢复 {} 份解压清单", manifests.len());
    }

    // 2. 引用计数重建
    let mut pending = Vec::new();
    ctx.engine.for_each_pending(|task| pending.push(task.clone()));
    ctx.registry.rebuild_refs(pending.iter());

    // 3. 延迟转换账本
    let requeued = ctx.ledger.startup_scan()?;
    if requeued > 0 {
        info!("重排 {} 个被中断的延迟转换", requeued);
    }

    write_snapshot(ctx).ok();
    Ok(())
}
