// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// 平台相册硬上限（单条 mediaGroup 消息最多 10 个媒体）
pub const PLATFORM_ALBUM_CAP: usize = 10;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 出站消息配置
    pub messenger: MessengerConfig,
    /// 下载配置
    #[serde(default)]
    pub fetch: FetchConfig,
    /// 队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 相册配置
    #[serde(default)]
    pub album: AlbumConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 转码配置
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// 延迟转换配置
    #[serde(default)]
    pub conversion: ConversionConfig,
    /// 准入闸门配置
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// WebDAV 配置
    #[serde(default)]
    pub webdav: WebdavConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 出站消息配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Bot API 令牌
    pub bot_token: String,
    /// 授权接收方（chat id 或 @username）
    pub target: String,
    /// Bot API 基础地址（自建 api server 时可覆盖）
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// 单次 RPC 超时（秒）
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// 进度心跳：最小百分比步进
    #[serde(default = "default_min_pct_step")]
    pub progress_min_pct_step: u8,
    /// 进度心跳：最小编辑间隔（秒）
    #[serde(default = "default_min_edit_interval")]
    pub progress_min_interval_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_rpc_timeout() -> u64 {
    120
}

fn default_min_pct_step() -> u8 {
    5
}

fn default_min_edit_interval() -> u64 {
    7
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// 流式下载分块大小 (KB)
    pub chunk_size_kb: u64,
    /// 静默超时阈值（秒）：超过该时长未收到任何字节即判定 STALL
    pub inactivity_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: 1024,
            inactivity_timeout_secs: 60,
        }
    }
}

impl FetchConfig {
    pub fn chunk_size(&self) -> usize {
        (self.chunk_size_kb * 1024) as usize
    }
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 下载阶段并发数
    pub download_concurrency: usize,
    /// 上传阶段并发数
    pub upload_concurrency: usize,
    /// 日志压实阈值（操作条数超过该值时重写日志）
    pub compact_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        // 低内存主机默认顺序执行
        Self {
            download_concurrency: 1,
            upload_concurrency: 1,
            compact_threshold: 512,
        }
    }
}

/// 相册配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumConfig {
    /// 单个相册最大媒体数（超过平台上限时截断为平台上限）
    pub size_cap: usize,
}

impl Default for AlbumConfig {
    fn default() -> Self {
        Self {
            size_cap: PLATFORM_ALBUM_CAP,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 通用重试预算
    pub max_attempts: u32,
    /// 指数退避基数（秒）
    pub base_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_seconds: 5,
        }
    }
}

/// 转码配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// 是否启用内联转码
    pub enabled: bool,
    /// 单次转码运行时上限（秒）
    pub timeout_secs: u64,
    /// 体积阈值 (MB)：超过该值的待转码视频改走延迟转换账本
    pub threshold_mb: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 300,
            threshold_mb: 100,
        }
    }
}

/// 延迟转换配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// 延迟转换重试上限
    pub max_retries: u32,
    /// 账本写入节奏（秒）
    pub state_save_interval_secs: u64,
    /// 已完成条目的保留时长（小时），超时清扫
    pub completed_ttl_hours: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            state_save_interval_secs: 10,
            completed_ttl_hours: 24,
        }
    }
}

/// 准入闸门配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// 仅 WiFi 模式：网络切换到移动数据时暂停下载准入
    pub wifi_only: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { wifi_only: true }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据目录（队列日志、状态文件、清单、隔离区）
    pub data_dir: PathBuf,
    /// 下载暂存目录
    pub work_dir: PathBuf,
    /// 剩余空间下限 (MB)：低于该值时解压暂停
    pub free_space_floor_mb: u64,
    /// 压缩包体积上限 (MB)：超过直接拒绝
    pub max_archive_mb: u64,
    /// 监督者快照写入间隔（秒）
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            work_dir: PathBuf::from("./data/work"),
            free_space_floor_mb: 1024,
            max_archive_mb: 6 * 1024,
            snapshot_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    pub fn free_space_floor(&self) -> u64 {
        self.free_space_floor_mb * 1024 * 1024
    }

    pub fn max_archive_size(&self) -> u64 {
        self.max_archive_mb * 1024 * 1024
    }
}

/// WebDAV 配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebdavConfig {
    /// 是否启用 WebDAV 抓取
    pub enabled: bool,
    /// 基础地址
    #[serde(default = "default_webdav_base")]
    pub base_url: String,
    /// 用户名
    #[serde(default)]
    pub username: String,
    /// 密码
    #[serde(default)]
    pub password: String,
    /// 目录列举超时（秒）
    #[serde(default = "default_webdav_timeout")]
    pub timeout_secs: u64,
}

fn default_webdav_base() -> String {
    "https://webdav.torbox.app".to_string()
}

fn default_webdav_timeout() -> u64 {
    120
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志目录
    pub dir: PathBuf,
    /// 日志级别过滤（EnvFilter 语法）
    pub filter: String,
    /// 是否输出到文件
    pub to_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/logs"),
            filter: "info,media_relay_rust=debug".to_string(),
            to_file: true,
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let mut config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }

    /// 归一化配置值
    ///
    /// 相册上限超过平台硬上限时截断为平台上限并记录日志
    pub fn normalize(&mut self) {
        if self.album.size_cap > PLATFORM_ALBUM_CAP {
            warn!(
                "album.size_cap={} 超过平台上限 {}，已截断",
                self.album.size_cap, PLATFORM_ALBUM_CAP
            );
            self.album.size_cap = PLATFORM_ALBUM_CAP;
        }
        if self.album.size_cap == 0 {
            warn!("album.size_cap 不能为 0，已重置为 {}", PLATFORM_ALBUM_CAP);
            self.album.size_cap = PLATFORM_ALBUM_CAP;
        }
        if self.queue.download_concurrency == 0 {
            self.queue.download_concurrency = 1;
        }
        if self.queue.upload_concurrency == 0 {
            self.queue.upload_concurrency = 1;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.messenger.bot_token.is_empty() {
            anyhow::bail!("messenger.bot_token 未配置");
        }
        if self.messenger.target.is_empty() {
            anyhow::bail!("messenger.target 未配置");
        }
        if self.fetch.chunk_size_kb == 0 {
            anyhow::bail!("fetch.chunk_size_kb 不能为 0");
        }
        if self.fetch.inactivity_timeout_secs == 0 {
            anyhow::bail!("fetch.inactivity_timeout_secs 不能为 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> &'static str {
        r#"
[messenger]
bot_token = "123:abc"
target = "@receiver"
"#
    }

    #[test]
    fn test_parse_minimal_config() {
        let mut config: AppConfig = toml::from_str(base_toml()).unwrap();
        config.normalize();
        config.validate().unwrap();

        // 未配置的节使用默认值
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_seconds, 5);
        assert_eq!(config.album.size_cap, 10);
        assert_eq!(config.fetch.chunk_size(), 1024 * 1024);
        assert_eq!(config.conversion.state_save_interval_secs, 10);
        assert!(config.admission.wifi_only);
    }

    #[test]
    fn test_album_cap_clamped_to_platform() {
        let toml_str = format!("{}\n[album]\nsize_cap = 50\n", base_toml());
        let mut config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.normalize();
        assert_eq!(config.album.size_cap, PLATFORM_ALBUM_CAP);
    }

    #[test]
    fn test_zero_concurrency_normalized() {
        let toml_str = format!(
            "{}\n[queue]\ndownload_concurrency = 0\nupload_concurrency = 0\ncompact_threshold = 16\n",
            base_toml()
        );
        let mut config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.normalize();
        assert_eq!(config.queue.download_concurrency, 1);
        assert_eq!(config.queue.upload_concurrency, 1);
    }

    #[test]
    fn test_missing_token_rejected() {
        let toml_str = r#"
[messenger]
bot_token = ""
target = "@receiver"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_unit_conversion() {
        let storage = StorageConfig::default();
        assert_eq!(storage.free_space_floor(), 1024 * 1024 * 1024);
        assert_eq!(storage.max_archive_size(), 6 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_roundtrip() {
        let mut config: AppConfig = toml::from_str(base_toml()).unwrap();
        config.normalize();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(back.album.size_cap, config.album.size_cap);
        assert_eq!(back.messenger.bot_token, "123:abc");
    }
}
