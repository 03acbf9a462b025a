//! 出站消息适配器
//!
//! 内核通过 `Messenger` 特征与消息运行时交互；生产实现为
//! Bot API HTTP 客户端（`api` 模块），测试用内存替身。
//! 适配器必须把限流等待映射为服务端报告的精确秒数。

pub mod api;
pub mod types;
pub mod updates;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use api::BotApiMessenger;

use crate::error::TaskResult;
use crate::fetcher::ProgressThrottle;
use crate::normalizer::VideoAttributes;
use crate::task::MediaKind;

/// 进度回调
pub type ProgressFn = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// 出站媒体条目
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub file_name: String,
    /// 视频附带时长/尺寸/缩略图
    pub video_attributes: Option<VideoAttributes>,
    /// 缩略图路径（视频）
    pub thumbnail: Option<PathBuf>,
}

impl OutgoingMedia {
    pub fn new(path: PathBuf, kind: MediaKind) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            kind,
            file_name,
            video_attributes: None,
            thumbnail: None,
        }
    }
}

/// 出站消息适配器特征
#[async_trait]
pub trait Messenger: Send + Sync {
    /// 解析授权接收方，返回会话 ID
    async fn resolve_target(&self) -> TaskResult<i64>;

    /// 发送一条多媒体相册消息（全部条目同类别）
    async fn send_album(&self, media: &[OutgoingMedia], caption: &str) -> TaskResult<()>;

    /// 发送单个媒体
    async fn send_media(&self, media: &OutgoingMedia, caption: &str) -> TaskResult<()>;

    /// 下载入站附件到本地（支持续传与静默看门狗）
    async fn fetch_attachment(
        &self,
        file_id: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn,
    ) -> TaskResult<u64>;

    /// 发送文本消息，返回消息 ID（进度消息的锚点）
    async fn send_text(&self, text: &str) -> TaskResult<i64>;

    /// 编辑已发送的文本消息
    async fn edit_text(&self, message_id: i64, text: &str) -> TaskResult<()>;

    /// 回复某条入站消息
    async fn reply_to(&self, reply_to: i64, text: &str) -> TaskResult<i64>;
}

// ============================================================================
// 通知器
// ============================================================================

/// 用户可见状态通知器
///
/// 所有对用户的回复都是尽力而为：发送失败只记日志，绝不影响任务。
/// 恢复的任务没有原始事件引用时静默跳过。
pub struct Notifier {
    messenger: std::sync::Arc<dyn Messenger>,
    min_pct_step: u8,
    min_interval_secs: u64,
}

impl Notifier {
    pub fn new(
        messenger: std::sync::Arc<dyn Messenger>,
        min_pct_step: u8,
        min_interval_secs: u64,
    ) -> Self {
        Self {
            messenger,
            min_pct_step,
            min_interval_secs,
        }
    }

    /// 回复某条入站消息（尽力而为）
    pub async fn reply(&self, reply_to: i64, text: &str) {
        if let Err(e) = self.messenger.reply_to(reply_to, text).await {
            debug!("用户回复发送失败（忽略）: {}", e);
        }
    }

    /// 按任务的原始事件引用回复；引用缺失时跳过
    pub async fn notify(&self, source_ref: Option<i64>, text: &str) {
        if let Some(reply_to) = source_ref {
            self.reply(reply_to, text).await;
        }
    }

    /// 创建进度汇报器（节流的可编辑状态消息）
    pub async fn progress_reporter(&self, source_ref: Option<i64>, title: &str) -> ProgressReporter {
        let message_id = match source_ref {
            Some(reply_to) => self.messenger.reply_to(reply_to, title).await.ok(),
            None => None,
        };
        ProgressReporter {
            messenger: self.messenger.clone(),
            message_id,
            throttle: ProgressThrottle::new(
                self.min_pct_step,
                std::time::Duration::from_secs(self.min_interval_secs),
            ),
        }
    }
}

/// 节流的进度汇报器
pub struct ProgressReporter {
    messenger: std::sync::Arc<dyn Messenger>,
    /// 状态消息 ID；创建失败时所有更新静默跳过
    message_id: Option<i64>,
    throttle: ProgressThrottle,
}

impl ProgressReporter {
    /// 更新进度文本（节流）
    pub async fn update(&self, pct: u8, text: &str) {
        let message_id = match self.message_id {
            Some(id) => id,
            None => return,
        };
        if !self.throttle.should_emit(pct) {
            return;
        }
        if let Err(e) = self.messenger.edit_text(message_id, text).await {
            debug!("进度消息更新失败（忽略）: {}", e);
        }
    }

    /// 终态文本（不节流）
    pub async fn finish(&self, text: &str) {
        if let Some(id) = self.message_id {
            self.throttle.force_emit();
            if let Err(e) = self.messenger.edit_text(id, text).await {
                debug!("终态消息更新失败（忽略）: {}", e);
            }
        }
    }
}
