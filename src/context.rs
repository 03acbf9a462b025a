//! 运行上下文
//!
//! 内核不依赖任何进程级单例：配置快照、各管理器与协作者适配器
//! 在启动时组装为 `AppContext`，显式传入每个工作线程。
//! 这也是暂停/恢复与测试隔离的前提。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::ContentCache;
use crate::cleanup::CleanupRegistry;
use crate::config::AppConfig;
use crate::conversion::ConversionLedger;
use crate::extractor::SecretGate;
use crate::fsutil;
use crate::messenger::{Messenger, Notifier};
use crate::queue::QueueEngine;
use crate::supervisor::{AdmissionGate, CurrentOp, PauseSwitch};
use crate::task::Stage;

/// 持久化状态布局
///
/// 磁盘上的稳定契约：
/// ```text
/// queue/download.log    queue/process.log    queue/upload.log
/// queue/retry.log       state/current.json   state/cache.json
/// state/conversions.json state/failed.json   manifests/<id>.json
/// quarantine/           lock.pid
/// ```
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(data_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self { data_dir, work_dir }
    }

    /// 创建所有需要的目录
    pub fn prepare(&self) -> std::io::Result<()> {
        fsutil::ensure_dir(&self.queue_dir())?;
        fsutil::ensure_dir(&self.state_dir())?;
        fsutil::ensure_dir(&self.manifests_dir())?;
        fsutil::ensure_dir(&self.quarantine_dir())?;
        fsutil::ensure_dir(&self.work_dir)?;
        Ok(())
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("quarantine")
    }

    /// 阶段日志路径
    pub fn journal_path(&self, stage: Stage) -> PathBuf {
        self.queue_dir().join(format!("{}.log", stage.as_str()))
    }

    /// 重试日志路径
    pub fn retry_log_path(&self) -> PathBuf {
        self.queue_dir().join("retry.log")
    }

    /// 内容缓存路径
    pub fn cache_path(&self) -> PathBuf {
        self.state_dir().join("cache.json")
    }

    /// 延迟转换账本路径
    pub fn conversions_path(&self) -> PathBuf {
        self.state_dir().join("conversions.json")
    }

    /// 隔离区索引路径
    pub fn failed_path(&self) -> PathBuf {
        self.state_dir().join("failed.json")
    }

    /// 监督者快照路径
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir().join("current.json")
    }

    /// 单例锁路径
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("lock.pid")
    }

    /// 指定压缩包的清单路径
    pub fn manifest_path(&self, manifest_id: &str) -> PathBuf {
        self.manifests_dir().join(format!("{}.json", manifest_id))
    }
}

impl From<&AppConfig> for StorageLayout {
    fn from(config: &AppConfig) -> Self {
        Self::new(
            config.storage.data_dir.clone(),
            config.storage.work_dir.clone(),
        )
    }
}

/// 应用上下文
///
/// 所有工作线程共享的显式依赖集合
pub struct AppContext {
    /// 配置快照
    pub config: AppConfig,
    /// 持久化布局
    pub layout: StorageLayout,
    /// 阶段队列引擎
    pub engine: Arc<QueueEngine>,
    /// 内容缓存
    pub cache: Arc<ContentCache>,
    /// 清理注册表
    pub registry: Arc<CleanupRegistry>,
    /// 延迟转换账本
    pub ledger: Arc<ConversionLedger>,
    /// 出站消息适配器
    pub messenger: Arc<dyn Messenger>,
    /// 用户可见状态通知器（节流 + 尽力而为）
    pub notifier: Arc<Notifier>,
    /// 下载准入闸门
    pub gate: AdmissionGate,
    /// 上传暂停开关（认证失效时挂起，凭证恢复钩子清除）
    pub upload_pause: PauseSwitch,
    /// 密码保护压缩包的密钥闸门
    pub secret_gate: Arc<SecretGate>,
    /// 当前长操作的取消句柄登记处
    pub current_op: Arc<CurrentOp>,
    /// 进程级取消令牌
    pub cancel: CancellationToken,
}

impl AppContext {
    /// 下载暂存目录
    pub fn work_dir(&self) -> &Path {
        &self.layout.work_dir
    }
}
