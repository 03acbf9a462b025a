//! Bot API 客户端实现
//!
//! 通过 HTTPS 实现 `Messenger` 特征：相册走 sendMediaGroup 的
//! multipart 上传，附件下载经 getFile 解析后交给可续传下载器。
//! 限流（429 + retry_after）严格映射为服务端报告的秒数。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ApiResponse, FileInfo, Message, Update};
use super::{Messenger, OutgoingMedia, ProgressFn};
use crate::config::{FetchConfig, MessengerConfig};
use crate::error::{classify_reqwest_error, TaskError, TaskResult};
use crate::fetcher::Fetcher;
use crate::task::MediaKind;

/// Bot API 客户端
pub struct BotApiMessenger {
    client: Client,
    /// `<api_base>/bot<token>`
    base: String,
    /// `<api_base>/file/bot<token>`
    file_base: String,
    target: String,
    /// 解析后的目标会话 ID 缓存
    resolved: Mutex<Option<i64>>,
    fetcher: Fetcher,
}

impl BotApiMessenger {
    pub fn new(config: &MessengerConfig, fetch: &FetchConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("构建消息 HTTP 客户端失败");
        let api_base = config.api_base.trim_end_matches('/');
        Self {
            client,
            base: format!("{}/bot{}", api_base, config.bot_token),
            file_base: format!("{}/file/bot{}", api_base, config.bot_token),
            target: config.target.clone(),
            resolved: Mutex::new(None),
            fetcher: Fetcher::new(fetch),
        }
    }

    /// 调用 JSON 方法
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> TaskResult<T> {
        let url = format!("{}/{}", self.base, method);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Self::decode(response).await
    }

    /// 调用 multipart 方法
    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: multipart::Form,
    ) -> TaskResult<T> {
        let url = format!("{}/{}", self.base, method);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> TaskResult<T> {
        let http_status = response.status().as_u16();
        let body: ApiResponse<T> = response.json().await.map_err(|e| TaskError::Network {
            detail: format!("响应解析失败: {}", e),
        })?;

        if body.ok {
            return body.result.ok_or(TaskError::Permanent {
                detail: "响应 ok 但缺少 result".to_string(),
            });
        }

        let retry_after = body.parameters.and_then(|p| p.retry_after);
        Err(classify_api_failure(
            body.error_code.unwrap_or(i64::from(http_status)),
            body.description.as_deref().unwrap_or(""),
            retry_after,
        ))
    }

    /// 长轮询拉取更新（超时独立于普通 RPC）
    pub async fn get_updates(&self, offset: i64, poll_timeout_secs: u64) -> TaskResult<Vec<Update>> {
        let url = format!("{}/getUpdates", self.base);
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(poll_timeout_secs + 30))
            .json(&json!({
                "offset": offset,
                "timeout": poll_timeout_secs,
                "allowed_updates": ["message"],
            }))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Self::decode(response).await
    }

    /// 构造单个媒体的上传分片
    async fn file_part(path: &Path, file_name: &str, mime: &str) -> TaskResult<multipart::Part> {
        let file = tokio::fs::File::open(path).await.map_err(|e| TaskError::Permanent {
            detail: format!("打开上传文件失败 {:?}: {}", path, e),
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| TaskError::Permanent {
                detail: format!("读取文件元数据失败: {}", e),
            })?
            .len();
        let stream = FramedRead::new(file, BytesCodec::new());
        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), len)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| TaskError::Permanent {
                detail: format!("非法 MIME: {}", e),
            })?;
        Ok(part)
    }

    fn mime_for(kind: MediaKind) -> &'static str {
        match kind {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
            _ => "application/octet-stream",
        }
    }
}

/// 把 API 错误映射到任务失败分类
///
/// 限流等待使用服务端给出的整秒数，不做近似
pub fn classify_api_failure(code: i64, description: &str, retry_after: Option<u64>) -> TaskError {
    if let Some(wait_secs) = retry_after {
        return TaskError::RateLimit { wait_secs };
    }
    let desc = description.to_lowercase();
    match code {
        429 => TaskError::RateLimit { wait_secs: 60 },
        401 | 403 => TaskError::Auth {
            detail: description.to_string(),
        },
        400 => {
            const PHOTO_SIZE_MARKERS: &[&str] = &[
                "photo_invalid_dimensions",
                "photo_save_file_invalid",
                "file is too big",
                "image_process_failed",
            ];
            const MEDIA_MARKERS: &[&str] = &[
                "wrong file identifier",
                "media_empty",
                "failed to get http url content",
                "wrong type of the web page content",
                "can't parse inputmedia",
                "video_content_type_invalid",
            ];
            if PHOTO_SIZE_MARKERS.iter().any(|m| desc.contains(m)) {
                TaskError::PhotoTooLarge
            } else if MEDIA_MARKERS.iter().any(|m| desc.contains(m)) {
                TaskError::MediaInvalid { offenders: vec![] }
            } else {
                TaskError::Permanent {
                    detail: description.to_string(),
                }
            }
        }
        code if (500..600).contains(&code) => TaskError::HttpStatus { code: code as u16 },
        _ => TaskError::Permanent {
            detail: format!("API 错误 {}: {}", code, description),
        },
    }
}

#[async_trait]
impl Messenger for BotApiMessenger {
    async fn resolve_target(&self) -> TaskResult<i64> {
        {
            let cached = self.resolved.lock().await;
            if let Some(id) = *cached {
                return Ok(id);
            }
        }

        // 数字 ID 直接使用，@username 经 getChat 解析
        let id = match self.target.parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                #[derive(serde::Deserialize)]
                struct ChatInfo {
                    id: i64,
                }
                let chat: ChatInfo = self
                    .call("getChat", json!({ "chat_id": self.target }))
                    .await?;
                chat.id
            }
        };

        *self.resolved.lock().await = Some(id);
        info!("目标接收方已解析: {} -> {}", self.target, id);
        Ok(id)
    }

    async fn send_album(&self, media: &[OutgoingMedia], caption: &str) -> TaskResult<()> {
        let chat_id = self.resolve_target().await?;

        let mut descriptors = Vec::with_capacity(media.len());
        let mut form = multipart::Form::new().text("chat_id", chat_id.to_string());

        for (i, item) in media.iter().enumerate() {
            let attach_name = format!("file{}", i);
            let mut descriptor = json!({
                "type": match item.kind {
                    MediaKind::Video => "video",
                    _ => "photo",
                },
                "media": format!("attach://{}", attach_name),
            });
            // 批次标题挂在第一个条目上
            if i == 0 {
                descriptor["caption"] = Value::String(caption.to_string());
            }
            if let Some(ref attrs) = item.video_attributes {
                descriptor["duration"] = json!(attrs.duration_secs);
                descriptor["width"] = json!(attrs.width);
                descriptor["height"] = json!(attrs.height);
            }
            if let Some(ref thumb) = item.thumbnail {
                let thumb_name = format!("thumb{}", i);
                descriptor["thumbnail"] = Value::String(format!("attach://{}", thumb_name));
                let part =
                    Self::file_part(thumb, &format!("{}.jpg", thumb_name), "image/jpeg").await?;
                form = form.part(thumb_name, part);
            }
            descriptors.push(descriptor);

            let part =
                Self::file_part(&item.path, &item.file_name, Self::mime_for(item.kind)).await?;
            form = form.part(attach_name, part);
        }

        let media_json =
            serde_json::to_string(&descriptors).map_err(|e| TaskError::Permanent {
                detail: format!("序列化相册描述失败: {}", e),
            })?;
        form = form.text("media", media_json);

        debug!("发送相册: {} 个条目", media.len());
        let _: Vec<Message> = self.call_multipart("sendMediaGroup", form).await?;
        Ok(())
    }

    async fn send_media(&self, media: &OutgoingMedia, caption: &str) -> TaskResult<()> {
        let chat_id = self.resolve_target().await?;

        let (method, field) = match media.kind {
            MediaKind::Image => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
            _ => ("sendDocument", "document"),
        };

        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string());

        if let Some(ref attrs) = media.video_attributes {
            form = form
                .text("duration", attrs.duration_secs.to_string())
                .text("width", attrs.width.to_string())
                .text("height", attrs.height.to_string());
        }
        if let Some(ref thumb) = media.thumbnail {
            let part = Self::file_part(thumb, "thumb.jpg", "image/jpeg").await?;
            form = form.part("thumbnail", part);
        }

        let part =
            Self::file_part(&media.path, &media.file_name, Self::mime_for(media.kind)).await?;
        form = form.part(field.to_string(), part);

        let _: Message = self.call_multipart(method, form).await?;
        Ok(())
    }

    async fn fetch_attachment(
        &self,
        file_id: &str,
        dest: &Path,
        cancel: &CancellationToken,
        mut progress: ProgressFn,
    ) -> TaskResult<u64> {
        let info: FileInfo = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = info.file_path.ok_or(TaskError::MediaInvalid {
            offenders: vec![file_id.to_string()],
        })?;

        let url = format!("{}/{}", self.file_base, file_path);
        let outcome = self
            .fetcher
            .fetch(&url, dest, None, cancel, |written, total| {
                progress(written, total)
            })
            .await?;

        if let Some(expected) = info.file_size {
            if outcome.bytes != expected {
                warn!(
                    "附件大小不符: 期望 {}, 实际 {}",
                    expected, outcome.bytes
                );
                return Err(TaskError::Integrity {
                    detail: format!("附件大小 {} != {}", outcome.bytes, expected),
                });
            }
        }
        Ok(outcome.bytes)
    }

    async fn send_text(&self, text: &str) -> TaskResult<i64> {
        let chat_id = self.resolve_target().await?;
        let msg: Message = self
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(msg.message_id)
    }

    async fn edit_text(&self, message_id: i64, text: &str) -> TaskResult<()> {
        let chat_id = self.resolve_target().await?;
        let _: Value = self
            .call(
                "editMessageText",
                json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn reply_to(&self, reply_to: i64, text: &str) -> TaskResult<i64> {
        let chat_id = self.resolve_target().await?;
        let msg: Message = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_parameters": { "message_id": reply_to, "allow_sending_without_reply": true },
                }),
            )
            .await?;
        Ok(msg.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_exact_seconds() {
        // retry_after 必须原样传递
        let err = classify_api_failure(429, "Too Many Requests: retry after 1678", Some(1678));
        assert_eq!(err, TaskError::RateLimit { wait_secs: 1678 });
    }

    #[test]
    fn test_auth_mapping() {
        let err = classify_api_failure(401, "Unauthorized", None);
        assert!(matches!(err, TaskError::Auth { .. }));
    }

    #[test]
    fn test_photo_too_large_mapping() {
        let err = classify_api_failure(400, "Bad Request: PHOTO_INVALID_DIMENSIONS", None);
        assert_eq!(err, TaskError::PhotoTooLarge);

        let err = classify_api_failure(400, "Request Entity Too Large: file is too big", None);
        assert_eq!(err, TaskError::PhotoTooLarge);
    }

    #[test]
    fn test_media_invalid_mapping() {
        let err = classify_api_failure(400, "Bad Request: wrong file identifier/HTTP URL specified", None);
        assert!(matches!(err, TaskError::MediaInvalid { .. }));

        let err = classify_api_failure(400, "Bad Request: VIDEO_CONTENT_TYPE_INVALID", None);
        assert!(matches!(err, TaskError::MediaInvalid { .. }));
    }

    #[test]
    fn test_server_error_mapping() {
        let err = classify_api_failure(502, "Bad Gateway", None);
        assert_eq!(err, TaskError::HttpStatus { code: 502 });
    }

    #[test]
    fn test_unknown_400_is_permanent() {
        let err = classify_api_failure(400, "Bad Request: message text is empty", None);
        assert!(matches!(err, TaskError::Permanent { .. }));
    }
}
