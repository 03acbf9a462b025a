//! 流式压缩包展开器
//!
//! 一次只解出一个条目到解压根目录下的唯一临时文件，最大限度压低
//! 磁盘占用。每个条目解出前检查剩余空间，低于下限进入背压等待。
//! 进度写入清单，崩溃后按清单跳过已处理条目续展。
//!
//! 密码保护的压缩包通过 `SecretGate` 阻塞等待外部提供密钥，
//! 同一时刻只允许一个压缩包处于等待密钥状态。

pub mod manifest;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub use manifest::{scan_manifests, Manifest, ManifestData};

use crate::error::{TaskError, TaskResult};
use crate::fsutil;
use crate::intake::kind_for_name;
use crate::task::MediaKind;

/// 背压重新探测间隔
const SPACE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// 展开器向外发布的事件（用户可见的暂停原因等）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorEvent {
    /// 剩余空间不足，展开暂停
    LowSpacePause { required: u64, available: u64 },
    /// 空间恢复，继续展开
    SpaceRecovered,
}

/// 解出的单个条目
#[derive(Debug)]
pub struct ExtractedEntry {
    /// 压缩包内条目名
    pub entry_name: String,
    /// 解出的临时文件路径
    pub temp_path: PathBuf,
    /// 媒体类别
    pub kind: MediaKind,
    /// 解压后大小
    pub size: u64,
}

/// 条目元信息（打开时一次性收集）
#[derive(Debug, Clone)]
struct EntryMeta {
    index: usize,
    name: String,
    kind: MediaKind,
    encrypted: bool,
}

// ============================================================================
// 密钥闸门
// ============================================================================

/// 等待密钥状态
#[derive(Debug, Default)]
struct SecretSlot {
    /// 等待密钥的压缩包名；None 表示无等待
    waiting_for: Option<String>,
    /// 外部送达的密钥
    delivered: Option<String>,
}

/// 密码保护压缩包的密钥闸门
///
/// 同一时刻只允许一个压缩包等待密钥
pub struct SecretGate {
    slot: AsyncMutex<SecretSlot>,
    notify: Notify,
}

impl SecretGate {
    pub fn new() -> Self {
        Self {
            slot: AsyncMutex::new(SecretSlot::default()),
            notify: Notify::new(),
        }
    }

    /// 阻塞等待外部送达密钥
    ///
    /// 已有其他压缩包在等待时返回错误（由重试机制稍后再试）
    pub async fn wait_for_secret(
        &self,
        archive_name: &str,
        cancel: &CancellationToken,
    ) -> TaskResult<String> {
        {
            let mut slot = self.slot.lock().await;
            if let Some(ref waiting) = slot.waiting_for {
                if waiting != archive_name {
                    return Err(TaskError::Permanent {
                        detail: format!("已有压缩包 {} 在等待密钥", waiting),
                    });
                }
            }
            slot.waiting_for = Some(archive_name.to_string());
        }

        loop {
            // 先建立等待句柄再检查，避免送达通知丢失
            let notified = self.notify.notified();
            {
                let mut slot = self.slot.lock().await;
                if let Some(secret) = slot.delivered.take() {
                    slot.waiting_for = None;
                    return Ok(secret);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Canceled),
                _ = notified => {}
            }
        }
    }

    /// 外部送达密钥（入站信号触发）
    pub async fn supply(&self, secret: String) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.waiting_for.is_some() {
            slot.delivered = Some(secret);
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// 当前等待密钥的压缩包名
    pub async fn waiting_for(&self) -> Option<String> {
        self.slot.lock().await.waiting_for.clone()
    }
}

impl Default for SecretGate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 展开器
// ============================================================================

/// 流式展开器
pub struct StreamingExtractor {
    archive_path: PathBuf,
    archive_name: String,
    extraction_root: PathBuf,
    manifest: Manifest,
    free_space_floor: u64,
    secret: Option<String>,
    events: Option<UnboundedSender<ExtractorEvent>>,
    /// 待处理条目（打开时收集）
    entries: Vec<EntryMeta>,
    cursor: usize,
    skipped_non_media: usize,
    low_space_notified: bool,
}

impl StreamingExtractor {
    /// 打开压缩包并收集条目元信息
    ///
    /// # Arguments
    /// * `manifest_path` - 清单路径（manifests/<id>.json）
    /// * `free_space_floor` - 剩余空间下限（字节）
    pub async fn open(
        archive_path: PathBuf,
        extraction_root: PathBuf,
        manifest_path: PathBuf,
        free_space_floor: u64,
        events: Option<UnboundedSender<ExtractorEvent>>,
    ) -> Result<Self> {
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());

        fsutil::ensure_dir(&extraction_root)?;
        let manifest = Manifest::load_or_create(
            manifest_path,
            &archive_name,
            &archive_path,
            &extraction_root,
        )?;

        // 条目枚举是阻塞 IO，放到阻塞线程池
        let path_for_scan = archive_path.clone();
        let (entries, skipped_non_media) =
            tokio::task::spawn_blocking(move || scan_entries(&path_for_scan))
                .await
                .context("条目枚举线程失败")??;

        let mut extractor = Self {
            archive_path,
            archive_name,
            extraction_root,
            manifest,
            free_space_floor,
            secret: None,
            events,
            entries,
            cursor: 0,
            skipped_non_media,
            low_space_notified: false,
        };
        extractor.manifest.set_total(extractor.entries.len())?;
        info!(
            "压缩包已打开: {} ({} 个媒体条目, 跳过 {} 个非媒体条目)",
            extractor.archive_name,
            extractor.entries.len(),
            extractor.skipped_non_media
        );
        Ok(extractor)
    }

    /// 是否包含加密条目
    pub fn needs_secret(&self) -> bool {
        self.secret.is_none() && self.entries.iter().any(|e| e.encrypted)
    }

    /// 设置解压密钥
    pub fn set_secret(&mut self, secret: String) {
        self.secret = Some(secret);
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn extraction_root(&self) -> &Path {
        &self.extraction_root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// 各类别媒体条目总数 (图片, 视频)
    pub fn totals_by_kind(&self) -> (usize, usize) {
        let images = self
            .entries
            .iter()
            .filter(|e| e.kind == MediaKind::Image)
            .count();
        let videos = self
            .entries
            .iter()
            .filter(|e| e.kind == MediaKind::Video)
            .count();
        (images, videos)
    }

    /// 解出下一个未处理条目；流结束返回 None
    ///
    /// 每个条目解出前执行剩余空间检查，不足时背压等待
    pub async fn next_entry(
        &mut self,
        cancel: &CancellationToken,
    ) -> TaskResult<Option<ExtractedEntry>> {
        loop {
            let meta = match self.entries.get(self.cursor) {
                Some(meta) => meta.clone(),
                None => return Ok(None),
            };
            self.cursor += 1;

            // 续展：已处理条目跳过
            if self.manifest.is_processed(&meta.name) {
                debug!("跳过已处理条目: {}", meta.name);
                continue;
            }

            self.wait_for_free_space(cancel).await?;

            let ext = Path::new(&meta.name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            let temp_path = fsutil::unique_temp_path(&self.extraction_root, &ext);

            let archive_path = self.archive_path.clone();
            let secret = self.secret.clone();
            let out_path = temp_path.clone();
            let index = meta.index;
            let size = tokio::task::spawn_blocking(move || {
                extract_entry(&archive_path, index, secret.as_deref(), &out_path)
            })
            .await
            .map_err(|e| TaskError::Permanent {
                detail: format!("解压线程失败: {}", e),
            })??;

            debug!("条目解出: {} -> {:?} ({} 字节)", meta.name, temp_path, size);
            return Ok(Some(ExtractedEntry {
                entry_name: meta.name,
                temp_path,
                kind: meta.kind,
                size,
            }));
        }
    }

    /// 下游确认条目已入队后更新清单
    pub fn acknowledge(&mut self, entry_name: &str) -> Result<()> {
        self.manifest.mark_processed(entry_name)
    }

    /// 背压等待：剩余空间低于下限时暂停并周期复查
    async fn wait_for_free_space(&mut self, cancel: &CancellationToken) -> TaskResult<()> {
        if self.free_space_floor == 0 {
            return Ok(());
        }
        loop {
            let available =
                fsutil::available_space(&self.extraction_root).unwrap_or(u64::MAX);
            if available >= self.free_space_floor {
                if self.low_space_notified {
                    self.low_space_notified = false;
                    if let Some(ref events) = self.events {
                        let _ = events.send(ExtractorEvent::SpaceRecovered);
                    }
                    info!("磁盘空间恢复，继续展开: {}", self.archive_name);
                }
                return Ok(());
            }

            if !self.low_space_notified {
                self.low_space_notified = true;
                warn!(
                    "磁盘空间不足 ({} < {})，展开暂停: {}",
                    fsutil::format_size(available),
                    fsutil::format_size(self.free_space_floor),
                    self.archive_name
                );
                if let Some(ref events) = self.events {
                    let _ = events.send(ExtractorEvent::LowSpacePause {
                        required: self.free_space_floor,
                        available,
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Canceled),
                _ = tokio::time::sleep(SPACE_CHECK_INTERVAL) => {}
            }
        }
    }
}

/// 枚举压缩包条目：媒体条目元信息 + 非媒体条目计数
fn scan_entries(archive_path: &Path) -> Result<(Vec<EntryMeta>, usize)> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("打开压缩包失败: {:?}", archive_path))?;
    let mut archive = ZipArchive::new(file).context("读取压缩包目录失败")?;

    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .with_context(|| format!("读取条目 {} 失败", index))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        match kind_for_name(&name) {
            Some(kind @ (MediaKind::Image | MediaKind::Video)) => {
                entries.push(EntryMeta {
                    index,
                    name,
                    kind,
                    encrypted: entry.encrypted(),
                });
            }
            _ => skipped += 1,
        }
    }
    Ok((entries, skipped))
}

/// 解出单个条目到目标路径（阻塞）
///
/// 1 MiB 缓冲流拷贝，不整段加载
fn extract_entry(
    archive_path: &Path,
    index: usize,
    secret: Option<&str>,
    out_path: &Path,
) -> TaskResult<u64> {
    let to_task_err = |detail: String| TaskError::Permanent { detail };

    let file = std::fs::File::open(archive_path)
        .map_err(|e| to_task_err(format!("打开压缩包失败: {}", e)))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| to_task_err(format!("读取压缩包目录失败: {}", e)))?;

    let mut entry = match secret {
        Some(secret) => archive
            .by_index_decrypt(index, secret.as_bytes())
            .map_err(|e| to_task_err(format!("解密条目失败: {}", e)))?,
        None => archive
            .by_index(index)
            .map_err(|e| to_task_err(format!("读取条目失败: {}", e)))?,
    };

    let out = std::fs::File::create(out_path)
        .map_err(|e| to_task_err(format!("创建临时文件失败: {}", e)))?;
    let mut writer = std::io::BufWriter::new(out);

    let mut buf = vec![0u8; 1024 * 1024];
    let mut written = 0u64;
    loop {
        let n = entry
            .read(&mut buf)
            .map_err(|e| to_task_err(format!("读取条目数据失败: {}", e)))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| to_task_err(format!("写入临时文件失败: {}", e)))?;
        written += n as u64;
    }
    writer
        .flush()
        .map_err(|e| to_task_err(format!("刷写临时文件失败: {}", e)))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// 构造测试用 ZIP：图片、视频、文本混合
    fn build_zip(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        for (name, data) in [
            ("photos/001.jpg", b"img1".as_slice()),
            ("photos/002.png", b"img2".as_slice()),
            ("clips/a.mp4", b"vid1".as_slice()),
            ("readme.txt", b"text".as_slice()),
            ("anim.gif", b"gif".as_slice()),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    async fn open_extractor(temp: &TempDir) -> StreamingExtractor {
        let archive = temp.path().join("A.zip");
        build_zip(&archive);
        StreamingExtractor::open(
            archive,
            temp.path().join("extracted"),
            temp.path().join("m1.json"),
            0, // 测试不检查空间
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_streams_media_entries_only() {
        let temp = TempDir::new().unwrap();
        let mut extractor = open_extractor(&temp).await;
        let cancel = CancellationToken::new();

        // 媒体条目 3 个（txt 与 gif 被跳过）
        assert_eq!(extractor.manifest().total_entries(), 3);
        assert_eq!(extractor.totals_by_kind(), (2, 1));

        let mut seen = Vec::new();
        while let Some(entry) = extractor.next_entry(&cancel).await.unwrap() {
            assert!(entry.temp_path.exists());
            assert!(entry.size > 0);
            seen.push((entry.entry_name.clone(), entry.kind));
            extractor.acknowledge(&entry.entry_name).unwrap();
        }

        assert_eq!(
            seen,
            vec![
                ("photos/001.jpg".to_string(), MediaKind::Image),
                ("photos/002.png".to_string(), MediaKind::Image),
                ("clips/a.mp4".to_string(), MediaKind::Video),
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_skips_acknowledged() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        {
            let mut extractor = open_extractor(&temp).await;
            let entry = extractor.next_entry(&cancel).await.unwrap().unwrap();
            extractor.acknowledge(&entry.entry_name).unwrap();
            // 模拟崩溃：第二个条目不确认
        }

        // 重新打开（复用同一清单）
        let mut extractor = StreamingExtractor::open(
            temp.path().join("A.zip"),
            temp.path().join("extracted"),
            temp.path().join("m1.json"),
            0,
            None,
        )
        .await
        .unwrap();

        let first = extractor.next_entry(&cancel).await.unwrap().unwrap();
        // 已确认的 001.jpg 被跳过
        assert_eq!(first.entry_name, "photos/002.png");
    }

    #[tokio::test]
    async fn test_plain_zip_needs_no_secret() {
        let temp = TempDir::new().unwrap();
        let extractor = open_extractor(&temp).await;
        assert!(!extractor.needs_secret());
    }

    #[tokio::test]
    async fn test_secret_gate_single_waiter() {
        let gate = SecretGate::new();
        let cancel = CancellationToken::new();

        // 后台等待密钥
        let gate = std::sync::Arc::new(gate);
        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            gate2.wait_for_secret("A.zip", &cancel2).await
        });

        // 等待注册完成后送达
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.waiting_for().await, Some("A.zip".to_string()));
        assert!(gate.supply("hunter2".to_string()).await);

        let secret = waiter.await.unwrap().unwrap();
        assert_eq!(secret, "hunter2");
        assert_eq!(gate.waiting_for().await, None);
    }

    #[tokio::test]
    async fn test_secret_gate_rejects_without_waiter() {
        let gate = SecretGate::new();
        // 无等待者时送达被拒绝
        assert!(!gate.supply("pw".to_string()).await);
    }
}
