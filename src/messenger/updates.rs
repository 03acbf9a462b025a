//! 入站更新循环
//!
//! 长轮询拉取更新，把消息映射为入站事件交给 intake，把控制信号
//! （准入开关 / 压缩包密钥 / 取消当前处理）交给监督者。
//! 循环自身的网络失败按分类退避，限流严格等待服务端秒数。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::api::BotApiMessenger;
use super::types::Message;
use crate::context::AppContext;
use crate::error::TaskError;
use crate::intake::{self, AttachmentInfo, IncomingMessage};

/// 长轮询超时（秒）
const POLL_TIMEOUT_SECS: u64 = 50;

/// 控制信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// 网络状态变化（wifi-only 策略的准入输入）
    NetworkChanged { wifi: bool },
    /// 密码保护压缩包的密钥送达
    ArchiveSecret { secret: String },
    /// 取消当前处理中的操作
    CancelCurrent,
    /// 凭证已恢复（清除认证失效导致的上传暂停）
    AuthRestored,
}

/// 从消息文本解析控制信号
///
/// 约定：`wifi:on` / `wifi:off` / `secret:<密钥>` / `cancel` / `auth:ok`
pub fn parse_signal(text: &str) -> Option<Signal> {
    let trimmed = text.trim();
    match trimmed {
        "wifi:on" => Some(Signal::NetworkChanged { wifi: true }),
        "wifi:off" => Some(Signal::NetworkChanged { wifi: false }),
        "cancel" => Some(Signal::CancelCurrent),
        "auth:ok" => Some(Signal::AuthRestored),
        _ => trimmed
            .strip_prefix("secret:")
            .map(|secret| Signal::ArchiveSecret {
                secret: secret.trim().to_string(),
            }),
    }
}

/// 处理控制信号
pub async fn on_signal(ctx: &AppContext, signal: Signal) {
    match signal {
        Signal::NetworkChanged { wifi } => {
            // 仅在 wifi-only 策略下关闭准入
            let admit = wifi || !ctx.config.admission.wifi_only;
            ctx.gate.set_admitted(admit);
            info!(
                "网络状态变化: wifi={}, 下载准入={}",
                wifi,
                if admit { "开" } else { "关" }
            );
        }
        Signal::ArchiveSecret { secret } => {
            if ctx.secret_gate.supply(secret).await {
                info!("压缩包密钥已送达");
            } else {
                warn!("收到密钥但没有压缩包在等待");
            }
        }
        Signal::CancelCurrent => {
            if ctx.current_op.cancel_active() {
                info!("当前处理已按信号取消");
            } else {
                debug!("收到取消信号但没有处理中的操作");
            }
        }
        Signal::AuthRestored => {
            if ctx.upload_pause.resume() {
                info!("凭证恢复信号已清除上传暂停");
            } else {
                debug!("收到凭证恢复信号但上传未处于暂停");
            }
        }
    }
}

/// 把 API 消息映射为入站事件
fn to_incoming(msg: &Message) -> IncomingMessage {
    let attachment = if let Some(ref doc) = msg.document {
        Some(AttachmentInfo {
            file_id: doc.file_id.clone(),
            file_name: doc
                .file_name
                .clone()
                .unwrap_or_else(|| format!("document_{}.bin", msg.message_id)),
            size: doc.file_size.unwrap_or(0),
        })
    } else if let Some(ref video) = msg.video {
        Some(AttachmentInfo {
            file_id: video.file_id.clone(),
            file_name: video
                .file_name
                .clone()
                .unwrap_or_else(|| format!("video_{}.mp4", msg.message_id)),
            size: video.file_size.unwrap_or(0),
        })
    } else {
        // 多档位图片取最大档
        msg.photo.as_ref().and_then(|sizes| {
            sizes
                .iter()
                .max_by_key(|s| s.width * s.height)
                .map(|largest| AttachmentInfo {
                    file_id: largest.file_id.clone(),
                    file_name: format!("photo_{}.jpg", msg.message_id),
                    size: largest.file_size.unwrap_or(0),
                })
        })
    };

    IncomingMessage {
        chat_id: msg.chat.id,
        message_id: msg.message_id,
        text: msg.text.clone().or_else(|| msg.caption.clone()),
        attachment,
    }
}

/// 更新循环主体，直到进程取消
pub async fn run_update_loop(ctx: Arc<AppContext>, api: Arc<BotApiMessenger>) {
    let mut offset = 0i64;
    info!("入站更新循环已启动");

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let updates = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = api.get_updates(offset, POLL_TIMEOUT_SECS) => result,
        };

        let updates = match updates {
            Ok(updates) => {
                // 带认证的长轮询成功即凭证可用：适配器侧自动清除
                // 认证失效导致的上传暂停
                if ctx.upload_pause.resume() {
                    info!("出站凭证已恢复（长轮询成功），上传暂停清除");
                }
                updates
            }
            Err(TaskError::RateLimit { wait_secs }) => {
                warn!("更新拉取被限流，等待 {} 秒", wait_secs);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => continue,
                }
            }
            Err(e) => {
                warn!("更新拉取失败: {}，5 秒后重试", e);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let msg = match update.message {
                Some(msg) => msg,
                None => continue,
            };

            // 纯文本先尝试按控制信号解析
            if let Some(signal) = msg.text.as_deref().and_then(parse_signal) {
                on_signal(&ctx, signal).await;
                continue;
            }

            let incoming = to_incoming(&msg);
            if incoming.attachment.is_none() && incoming.text.is_none() {
                continue;
            }
            match intake::on_message(&ctx, incoming).await {
                Ok(0) => debug!("消息 {} 未产生任务", msg.message_id),
                Ok(n) => debug!("消息 {} 派生 {} 个任务", msg.message_id, n),
                Err(e) => warn!("入站消息处理失败: {:#}", e),
            }
        }
    }

    info!("入站更新循环已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::types::{Chat, Document, PhotoSize};

    #[test]
    fn test_parse_signal() {
        assert_eq!(
            parse_signal("wifi:off"),
            Some(Signal::NetworkChanged { wifi: false })
        );
        assert_eq!(
            parse_signal("secret: hunter2"),
            Some(Signal::ArchiveSecret {
                secret: "hunter2".to_string()
            })
        );
        assert_eq!(parse_signal("cancel"), Some(Signal::CancelCurrent));
        assert_eq!(parse_signal("auth:ok"), Some(Signal::AuthRestored));
        assert_eq!(parse_signal("随便聊聊"), None);
    }

    #[test]
    fn test_to_incoming_document() {
        let msg = Message {
            message_id: 7,
            chat: Chat { id: 42 },
            text: None,
            caption: Some("给你".to_string()),
            document: Some(Document {
                file_id: "BQAC".to_string(),
                file_name: Some("pack.zip".to_string()),
                file_size: Some(1024),
            }),
            photo: None,
            video: None,
        };
        let incoming = to_incoming(&msg);
        let att = incoming.attachment.unwrap();
        assert_eq!(att.file_name, "pack.zip");
        assert_eq!(att.size, 1024);
        assert_eq!(incoming.text.as_deref(), Some("给你"));
    }

    #[test]
    fn test_to_incoming_picks_largest_photo() {
        let msg = Message {
            message_id: 9,
            chat: Chat { id: 42 },
            text: None,
            caption: None,
            document: None,
            photo: Some(vec![
                PhotoSize {
                    file_id: "small".to_string(),
                    file_size: Some(100),
                    width: 90,
                    height: 60,
                },
                PhotoSize {
                    file_id: "big".to_string(),
                    file_size: Some(90_000),
                    width: 1280,
                    height: 960,
                },
            ]),
            video: None,
        };
        let incoming = to_incoming(&msg);
        let att = incoming.attachment.unwrap();
        assert_eq!(att.file_id, "big");
        assert_eq!(att.file_name, "photo_9.jpg");
    }
}
