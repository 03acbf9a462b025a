//! 任务失败分类与重试策略
//!
//! 工作线程以非成功方式终止任务时，只允许使用这里定义的分类。
//! 未知异常经过一次 sanity 重试后包装为 `Permanent`。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 通用退避上限（秒）
const BACKOFF_CAP_SECS: u64 = 300;

/// 任务失败分类
///
/// 每个分类决定三件事：是否可重试、重试是否消耗预算、退避多久。
/// 限流等待严格使用服务端报告的秒数，不做近似。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum TaskError {
    /// 对端限流，携带服务端要求的等待秒数
    RateLimit { wait_secs: u64 },
    /// 域名解析失败
    Dns { detail: String },
    /// 网络错误（连接拒绝/重置/不可达）
    Network { detail: String },
    /// 下载静默超时（看门狗触发）
    Stall,
    /// HTTP 状态码异常
    HttpStatus { code: u16 },
    /// 下载不完整（最终大小与声明不符）
    Incomplete { expected: u64, actual: u64 },
    /// 完整性校验失败（哈希/大小不匹配），从零重试一次
    Integrity { detail: String },
    /// 转码超时
    NormalizeTimeout,
    /// 对端拒绝媒体对象，需要拆分并延迟转换
    MediaInvalid { offenders: Vec<String> },
    /// 照片超过平台大小限制，压缩后立即重试
    PhotoTooLarge,
    /// 适配器认证失效，等待外部钩子恢复
    Auth { detail: String },
    /// 操作被取消
    Canceled,
    /// 永久失败（超出预算或不可恢复），任务进入隔离区
    Permanent { detail: String },
}

impl TaskError {
    /// 分类名（持久化到任务记录的 last_error_class 字段）
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::Dns { .. } => "dns",
            Self::Network { .. } => "network",
            Self::Stall => "stall",
            Self::HttpStatus { .. } => "http_status",
            Self::Incomplete { .. } => "incomplete",
            Self::Integrity { .. } => "integrity",
            Self::NormalizeTimeout => "normalize_timeout",
            Self::MediaInvalid { .. } => "media_invalid",
            Self::PhotoTooLarge => "photo_too_large",
            Self::Auth { .. } => "auth",
            Self::Canceled => "canceled",
            Self::Permanent { .. } => "permanent",
        }
    }

    /// 是否可以在原队列中延迟重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimit { .. }
            | Self::Dns { .. }
            | Self::Network { .. }
            | Self::Stall
            | Self::Incomplete { .. }
            | Self::Integrity { .. }
            | Self::NormalizeTimeout
            | Self::PhotoTooLarge
            | Self::Auth { .. } => true,
            Self::HttpStatus { code } => *code >= 500 || *code == 429 || *code == 408,
            // MediaInvalid 不直接重试：上传工作线程负责拆分批次并写入延迟转换账本
            Self::MediaInvalid { .. } => false,
            Self::Canceled | Self::Permanent { .. } => false,
        }
    }

    /// 本次失败是否消耗重试预算
    ///
    /// 限流等待不消耗预算（服务端明确给出了恢复时间）；
    /// 认证失效由上传暂停开关控制，同样不消耗。
    pub fn consumes_budget(&self) -> bool {
        !matches!(self, Self::RateLimit { .. } | Self::Auth { .. })
    }

    /// 计算第 n 次重试前的退避时长（n 从 1 开始计）
    ///
    /// - 限流：严格等待服务端秒数
    /// - 静默超时：`5·2^(n-1)`，不封顶（实际受重试预算约束）
    /// - 完整性失败 / 照片压缩：立即重试
    /// - 认证失效：立即重排，节奏由上传暂停开关控制（任务在
    ///   开关清除前不会被工作线程触碰）
    /// - 其余：`min(base·2^n, 300)`
    pub fn backoff(&self, attempt: u32, base_secs: u64) -> Duration {
        match self {
            Self::RateLimit { wait_secs } => Duration::from_secs(*wait_secs),
            Self::Stall => {
                let exp = attempt.saturating_sub(1).min(10);
                Duration::from_secs(5u64.saturating_mul(1 << exp))
            }
            Self::Integrity { .. } | Self::PhotoTooLarge => Duration::ZERO,
            Self::Auth { .. } => Duration::ZERO,
            _ => {
                let exp = attempt.min(10);
                let delay = base_secs.saturating_mul(1u64 << exp);
                Duration::from_secs(delay.min(BACKOFF_CAP_SECS))
            }
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit { wait_secs } => write!(f, "对端限流，需等待 {} 秒", wait_secs),
            Self::Dns { detail } => write!(f, "域名解析失败: {}", detail),
            Self::Network { detail } => write!(f, "网络错误: {}", detail),
            Self::Stall => write!(f, "下载静默超时"),
            Self::HttpStatus { code } => write!(f, "HTTP 状态异常: {}", code),
            Self::Incomplete { expected, actual } => {
                write!(f, "下载不完整: 期望 {} 字节，实际 {} 字节", expected, actual)
            }
            Self::Integrity { detail } => write!(f, "完整性校验失败: {}", detail),
            Self::NormalizeTimeout => write!(f, "视频转码超时"),
            Self::MediaInvalid { offenders } => {
                write!(f, "对端拒绝媒体对象: {}", offenders.join(", "))
            }
            Self::PhotoTooLarge => write!(f, "照片超过平台大小限制"),
            Self::Auth { detail } => write!(f, "认证失效: {}", detail),
            Self::Canceled => write!(f, "操作已取消"),
            Self::Permanent { detail } => write!(f, "永久失败: {}", detail),
        }
    }
}

impl std::error::Error for TaskError {}

/// 任务执行结果
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// 将 reqwest 错误归类到任务失败分类
///
/// reqwest 不单独暴露 DNS 错误类型，按错误链文本判定
pub fn classify_reqwest_error(err: &reqwest::Error) -> TaskError {
    let detail = err.to_string();
    if err.is_timeout() {
        return TaskError::Stall;
    }
    if let Some(status) = err.status() {
        return TaskError::HttpStatus {
            code: status.as_u16(),
        };
    }

    // 遍历错误链，识别 DNS 解析失败
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string().to_lowercase();
        if text.contains("dns") || text.contains("name or service not known") {
            return TaskError::Dns { detail };
        }
        source = e.source();
    }

    TaskError::Network { detail }
}

/// 将 anyhow 错误包装为 Permanent（未知异常的最终归宿）
pub fn wrap_unknown(err: anyhow::Error) -> TaskError {
    TaskError::Permanent {
        detail: format!("{:#}", err),
    }
}
