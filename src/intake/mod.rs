//! 入站事件分类
//!
//! 消息适配器把入站消息交给这里：识别附件类别、做 (文件名, 大小)
//! 预去重、拒绝超限压缩包、从文本中提取 CDN/WebDAV 外链，
//! 并派生相应的下载任务。

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::task::{DownloadSource, MediaKind, TaskPayload};

/// 压缩包扩展名
pub const ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".xz"];

/// 图片扩展名（gif 排除，避免按文档处理）
pub const PHOTO_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp"];

/// 动图扩展名（暂按跳过处理）
pub const ANIMATED_EXTENSIONS: &[&str] = &[".gif"];

/// 视频扩展名
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".webm", ".ts", ".m4v", ".flv", ".wmv", ".3gp", ".vob",
    ".m2ts", ".mts", ".m2v", ".mpg", ".mpeg", ".ogv", ".ogg", ".rm", ".rmvb", ".asf", ".amv",
];

/// 按文件名判断类别；gif 与未知扩展返回 None
pub fn kind_for_name(name: &str) -> Option<MediaKind> {
    let lower = name.to_lowercase();
    let ext = match lower.rfind('.') {
        Some(pos) => &lower[pos..],
        None => return None,
    };
    if ANIMATED_EXTENSIONS.contains(&ext) {
        return None;
    }
    if PHOTO_EXTENSIONS.contains(&ext) {
        return Some(MediaKind::Image);
    }
    if VIDEO_EXTENSIONS.contains(&ext) {
        return Some(MediaKind::Video);
    }
    if ARCHIVE_EXTENSIONS.contains(&ext) {
        return Some(MediaKind::Archive);
    }
    None
}

/// 入站消息
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    /// 文本内容（可能携带外链）
    pub text: Option<String>,
    /// 附件信息
    pub attachment: Option<AttachmentInfo>,
}

/// 附件信息
#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    /// 适配器侧的文件句柄
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
}

/// 从文本中提取命中指定主机后缀的 HTTPS 链接
///
/// 去重并保持出现顺序
pub fn extract_links(text: &str, host_suffix: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("http") {
        let candidate = &rest[pos..];
        let end = candidate
            .find(|c: char| c.is_whitespace() || c == '>' || c == '<' || c == '"')
            .unwrap_or(candidate.len());
        let raw = candidate[..end].trim_end_matches([',', '.', ')']);
        if let Ok(url) = reqwest::Url::parse(raw) {
            if let Some(host) = url.host_str() {
                if (host == host_suffix || host.ends_with(&format!(".{}", host_suffix)))
                    && !links.contains(&raw.to_string())
                {
                    links.push(raw.to_string());
                }
            }
        }
        rest = &rest[pos + end.max(4)..];
    }
    links
}

/// 从 CDN 链接推断文件名
///
/// 路径形如 `/<type>/<uuid>`，按 type 推断扩展名；
/// 无法识别时以 uuid 前缀命名
pub fn filename_from_cdn_url(url: &str) -> String {
    let parsed = match reqwest::Url::parse(url) {
        Ok(u) => u,
        Err(_) => return "cdn_download.bin".to_string(),
    };
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let (file_type, file_id) = match segments.as_slice() {
        [t, id, ..] => (*t, *id),
        [id] => ("", *id),
        _ => return "cdn_download.bin".to_string(),
    };

    let ext = match file_type.to_lowercase().as_str() {
        "zip" => ".zip",
        "rar" => ".rar",
        "7z" => ".7z",
        "video" => ".mp4",
        "audio" => ".mp3",
        "image" => ".jpg",
        "document" => ".pdf",
        _ => "",
    };
    let short_id: String = file_id.chars().take(8).collect();
    format!("cdn_{}{}", short_id, ext)
}

/// 处理入站消息：分类并派生下载任务
///
/// 返回派生的任务数
pub async fn on_message(ctx: &AppContext, msg: IncomingMessage) -> Result<usize> {
    let mut created = 0usize;

    if let Some(ref attachment) = msg.attachment {
        created += handle_attachment(ctx, &msg, attachment).await?;
    }

    if let Some(ref text) = msg.text {
        created += handle_links(ctx, &msg, text).await?;
    }

    Ok(created)
}

/// 处理附件
async fn handle_attachment(
    ctx: &AppContext,
    msg: &IncomingMessage,
    attachment: &AttachmentInfo,
) -> Result<usize> {
    let kind = match kind_for_name(&attachment.file_name) {
        Some(kind) => kind,
        None => {
            info!("忽略不支持的附件: {}", attachment.file_name);
            return Ok(0);
        }
    };

    // (文件名, 精确大小) 预去重
    if ctx
        .cache
        .is_processed_by_name(&attachment.file_name, attachment.size)
    {
        info!("附件已处理过，跳过: {}", attachment.file_name);
        ctx.notifier
            .reply(
                msg.message_id,
                &format!("⏭️ 已处理过，跳过: {}", attachment.file_name),
            )
            .await;
        return Ok(0);
    }

    // 压缩包体积上限
    if kind == MediaKind::Archive && attachment.size > ctx.config.storage.max_archive_size() {
        warn!(
            "压缩包超过体积上限，拒绝: {} ({})",
            attachment.file_name,
            crate::fsutil::format_size(attachment.size)
        );
        ctx.notifier
            .reply(
                msg.message_id,
                &format!(
                    "❌ 压缩包超过 {} 上限: {}",
                    crate::fsutil::format_size(ctx.config.storage.max_archive_size()),
                    attachment.file_name
                ),
            )
            .await;
        return Ok(0);
    }

    let task = ctx
        .engine
        .new_task(
            kind,
            TaskPayload::Download {
                source: DownloadSource::Attachment {
                    file_id: attachment.file_id.clone(),
                    chat_id: msg.chat_id,
                    message_id: msg.message_id,
                },
                dest_dir: ctx.work_dir().to_path_buf(),
                file_name: attachment.file_name.clone(),
                expected_size: Some(attachment.size),
            },
        )
        .with_source(Some(msg.message_id));
    ctx.engine.enqueue(task)?;
    info!(
        "附件任务入队: {} ({:?})",
        attachment.file_name, kind
    );
    Ok(1)
}

/// 处理文本外链
async fn handle_links(ctx: &AppContext, msg: &IncomingMessage, text: &str) -> Result<usize> {
    let mut created = 0usize;

    // CDN 直链
    for url in extract_links(text, "tb-cdn.st") {
        let file_name = filename_from_cdn_url(&url);
        let kind = kind_for_name(&file_name).unwrap_or(MediaKind::TextLink);
        let task = ctx
            .engine
            .new_task(
                kind,
                TaskPayload::Download {
                    source: DownloadSource::Http { url: url.clone() },
                    dest_dir: ctx.work_dir().to_path_buf(),
                    file_name,
                    expected_size: None,
                },
            )
            .with_source(Some(msg.message_id));
        ctx.engine.enqueue(task)?;
        info!("CDN 外链任务入队: {}", url);
        created += 1;
    }

    // WebDAV 分享目录
    if ctx.config.webdav.enabled {
        let webdav_host = reqwest::Url::parse(&ctx.config.webdav.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        if let Some(host) = webdav_host {
            for url in extract_links(text, &host) {
                let task = ctx
                    .engine
                    .new_task(
                        MediaKind::TextLink,
                        TaskPayload::WebdavCrawl { url: url.clone() },
                    )
                    .with_source(Some(msg.message_id));
                ctx.engine.enqueue(task)?;
                info!("WebDAV 抓取任务入队: {}", url);
                created += 1;
            }
        }
    }

    Ok(created)
}

/// 判断文件是否为压缩包
pub fn is_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(kind_for_name)
        == Some(MediaKind::Archive)
}
