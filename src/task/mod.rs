//! 任务模型定义
//!
//! 所有阶段队列共享同一种任务记录：公共字段 + 带判别符的载荷。
//! 记录以 JSON 持久化到阶段日志；恢复时遇到未知判别符跳过并告警，
//! 保证向前兼容。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 媒体/载荷类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// 图片
    Image,
    /// 视频
    Video,
    /// 普通文档
    Document,
    /// 压缩包
    Archive,
    /// 文本外链
    TextLink,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Archive => "archive",
            MediaKind::TextLink => "text_link",
        }
    }

    /// 相册分组显示名
    pub fn album_label(&self) -> &'static str {
        match self {
            MediaKind::Image => "Images",
            MediaKind::Video => "Videos",
            _ => "Files",
        }
    }
}

/// 归属压缩包上下文
///
/// 属于某个压缩包的文件在整条流水线上携带该上下文，
/// 用于相册分组、清理注册表引用计数和清单定位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveContext {
    /// 压缩包展示名
    pub archive_name: String,
    /// 解压根目录
    pub extraction_root: PathBuf,
    /// 清单 ID（manifests/<id>.json）
    pub manifest_id: String,
}

/// 下载来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum DownloadSource {
    /// 入站消息附件（由消息适配器取流）
    Attachment {
        file_id: String,
        chat_id: i64,
        message_id: i64,
    },
    /// 外部 CDN 直链
    Http { url: String },
}

/// 任务载荷（带判别符的变体）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// 下载载荷到本地
    Download {
        source: DownloadSource,
        dest_dir: PathBuf,
        file_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_size: Option<u64>,
    },
    /// 校验压缩包并准备流式解压（产生 ExpandEntry 后继）
    Extract { archive_path: PathBuf },
    /// 流式展开压缩包条目（支持按清单断点续展）
    ExpandEntry { archive_path: PathBuf },
    /// 归一化单个视频（直传路径）
    Normalize {
        input: PathBuf,
        file_name: String,
    },
    /// 写入延迟转换账本
    DeferredConvert {
        input: PathBuf,
        file_name: String,
    },
    /// 发送一批同类媒体（单条相册消息）
    AlbumDispatch {
        files: Vec<PathBuf>,
        kind: MediaKind,
        archive_name: String,
        batch_index: usize,
        total_batches: usize,
    },
    /// 发送单个媒体
    DirectUpload {
        file: PathBuf,
        kind: MediaKind,
        file_name: String,
    },
    /// 递归列举 WebDAV 目录并派生文件下载任务
    WebdavCrawl { url: String },
    /// 下载单个 WebDAV 文件
    WebdavFile {
        remote_path: String,
        dest_dir: PathBuf,
        file_name: String,
        size: u64,
    },
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Process,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Process => "process",
            Stage::Upload => "upload",
        }
    }

    pub const ALL: [Stage; 3] = [Stage::Download, Stage::Process, Stage::Upload];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskPayload {
    /// 载荷归属的阶段
    pub fn stage(&self) -> Stage {
        match self {
            TaskPayload::Download { .. }
            | TaskPayload::WebdavCrawl { .. }
            | TaskPayload::WebdavFile { .. } => Stage::Download,
            TaskPayload::Extract { .. }
            | TaskPayload::ExpandEntry { .. }
            | TaskPayload::Normalize { .. }
            | TaskPayload::DeferredConvert { .. } => Stage::Process,
            TaskPayload::AlbumDispatch { .. } | TaskPayload::DirectUpload { .. } => Stage::Upload,
        }
    }

    /// 判别符名（用于日志和快照）
    pub fn discriminant(&self) -> &'static str {
        match self {
            TaskPayload::Download { .. } => "download",
            TaskPayload::Extract { .. } => "extract",
            TaskPayload::ExpandEntry { .. } => "expand_entry",
            TaskPayload::Normalize { .. } => "normalize",
            TaskPayload::DeferredConvert { .. } => "deferred_convert",
            TaskPayload::AlbumDispatch { .. } => "album_dispatch",
            TaskPayload::DirectUpload { .. } => "direct_upload",
            TaskPayload::WebdavCrawl { .. } => "webdav_crawl",
            TaskPayload::WebdavFile { .. } => "webdav_file",
        }
    }
}

/// 流水线任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 单进程单调递增 ID，恢复后保持稳定
    pub id: u64,
    /// 原始事件引用（入站消息 ID）；崩溃恢复的任务可能为空，
    /// 所有面向用户的回复都以其存在为前提，尽力而为
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<i64>,
    /// 载荷类别
    pub kind: MediaKind,
    /// 归属压缩包上下文
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveContext>,
    /// 已消耗的重试次数
    #[serde(default)]
    pub retry_count: u32,
    /// 下次允许执行时间；None 表示随时可执行
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// 最近一次失败分类名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<String>,
    /// 终态成功后需要删除的文件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_refs: Vec<PathBuf>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 载荷
    pub payload: TaskPayload,
}

impl Task {
    /// 创建新任务（ID 由队列引擎分配）
    pub fn new(id: u64, kind: MediaKind, payload: TaskPayload) -> Self {
        Self {
            id,
            source_ref: None,
            kind,
            archive: None,
            retry_count: 0,
            next_attempt_at: None,
            last_error_class: None,
            cleanup_refs: Vec::new(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// 绑定原始事件引用
    pub fn with_source(mut self, source_ref: Option<i64>) -> Self {
        self.source_ref = source_ref;
        self
    }

    /// 绑定压缩包上下文
    pub fn with_archive(mut self, ctx: ArchiveContext) -> Self {
        self.archive = Some(ctx);
        self
    }

    /// 追加清理引用
    pub fn with_cleanup(mut self, refs: Vec<PathBuf>) -> Self {
        self.cleanup_refs = refs;
        self
    }

    /// 任务归属阶段
    pub fn stage(&self) -> Stage {
        self.payload.stage()
    }

    /// 当前时刻是否允许执行
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// 任务摘要（快照与日志用）
    pub fn describe(&self) -> String {
        match &self.payload {
            TaskPayload::Download { file_name, .. } => format!("download {}", file_name),
            TaskPayload::Extract { archive_path } => {
                format!("extract {:?}", archive_path.file_name().unwrap_or_default())
            }
            TaskPayload::ExpandEntry { archive_path } => {
                format!("expand {:?}", archive_path.file_name().unwrap_or_default())
            }
            TaskPayload::Normalize { file_name, .. } => format!("normalize {}", file_name),
            TaskPayload::DeferredConvert { file_name, .. } => format!("defer {}", file_name),
            TaskPayload::AlbumDispatch {
                files,
                kind,
                archive_name,
                batch_index,
                total_batches,
            } => format!(
                "album {} {} ({}/{}: {} files)",
                archive_name,
                kind.as_str(),
                batch_index,
                total_batches,
                files.len()
            ),
            TaskPayload::DirectUpload { file_name, .. } => format!("upload {}", file_name),
            TaskPayload::WebdavCrawl { url } => format!("webdav crawl {}", url),
            TaskPayload::WebdavFile { remote_path, .. } => format!("webdav file {}", remote_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_task(id: u64) -> Task {
        Task::new(
            id,
            MediaKind::Archive,
            TaskPayload::Download {
                source: DownloadSource::Attachment {
                    file_id: "BQACAgUAAx".to_string(),
                    chat_id: 100,
                    message_id: 7,
                },
                dest_dir: PathBuf::from("/tmp/work"),
                file_name: "a.zip".to_string(),
                expected_size: Some(1024),
            },
        )
    }

    #[test]
    fn test_stage_routing() {
        assert_eq!(sample_task(1).stage(), Stage::Download);

        let extract = Task::new(
            2,
            MediaKind::Archive,
            TaskPayload::Extract {
                archive_path: PathBuf::from("/tmp/a.zip"),
            },
        );
        assert_eq!(extract.stage(), Stage::Process);

        let album = Task::new(
            3,
            MediaKind::Image,
            TaskPayload::AlbumDispatch {
                files: vec![],
                kind: MediaKind::Image,
                archive_name: "a.zip".into(),
                batch_index: 1,
                total_batches: 1,
            },
        );
        assert_eq!(album.stage(), Stage::Upload);
    }

    #[test]
    fn test_serde_roundtrip() {
        // 入队后恢复必须与内存中的任务等价
        let task = sample_task(42)
            .with_source(Some(999))
            .with_cleanup(vec![PathBuf::from("/tmp/work/a.zip")]);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn test_unknown_discriminant_rejected() {
        // 未知判别符解析失败，由恢复逻辑跳过
        let json = r#"{
            "id": 1,
            "kind": "video",
            "created_at": "2025-01-01T00:00:00Z",
            "payload": {"type": "hologram_render", "file": "/x"}
        }"#;
        assert!(serde_json::from_str::<Task>(json).is_err());
    }

    #[test]
    fn test_legacy_record_defaults() {
        // 旧版记录缺失的字段补保守默认值
        let json = r#"{
            "id": 5,
            "kind": "image",
            "created_at": "2025-01-01T00:00:00Z",
            "payload": {"type": "direct_upload", "file": "/tmp/x.jpg", "kind": "image", "file_name": "x.jpg"}
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.retry_count, 0);
        assert!(task.cleanup_refs.is_empty());
        assert!(task.next_attempt_at.is_none());
        assert!(task.source_ref.is_none());
    }

    #[test]
    fn test_is_due() {
        let mut task = sample_task(1);
        let now = Utc::now();
        assert!(task.is_due(now));

        task.next_attempt_at = Some(now + Duration::seconds(30));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + Duration::seconds(31)));
    }
}
