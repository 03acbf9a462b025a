// 出站消息适配器类型定义
//
// Bot API 响应与更新流的 serde 映射，只保留内核用到的字段

use serde::Deserialize;

/// 统一响应包装
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

/// 响应附加参数（限流等待秒数在这里）
#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

/// 会话
#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// 文档附件
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// 图片尺寸档位（服务器返回多档，取最大）
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    pub width: u32,
    pub height: u32,
}

/// 视频附件
#[derive(Debug, Clone, Deserialize)]
pub struct Video {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// 入站消息
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub video: Option<Video>,
}

/// 更新记录
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

/// getFile 结果
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flood_wait_response() {
        let json = r#"{
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 1678",
            "parameters": {"retry_after": 1678}
        }"#;
        let resp: ApiResponse<Message> = serde_json::from_str(json).unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.parameters.unwrap().retry_after, Some(1678));
    }

    #[test]
    fn test_parse_update_with_document() {
        let json = r#"{
            "update_id": 10,
            "message": {
                "message_id": 55,
                "chat": {"id": -100123},
                "document": {"file_id": "BQAC", "file_name": "pack.zip", "file_size": 2048}
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, -100123);
        let doc = msg.document.unwrap();
        assert_eq!(doc.file_name.as_deref(), Some("pack.zip"));
        assert_eq!(doc.file_size, Some(2048));
    }
}
