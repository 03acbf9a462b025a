// 媒体中转机器人核心库
// 监听入站会话中的压缩包/媒体/外链，落盘、解压过滤、归一化后
// 按相册批量转发给授权接收方

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 失败分类与重试策略
pub mod error;

// 任务模型
pub mod task;

// 阶段队列引擎
pub mod queue;

// 可续传下载器
pub mod fetcher;

// WebDAV 抓取
pub mod webdav;

// 流式压缩包展开
pub mod extractor;

// 媒体归一化
pub mod normalizer;

// 延迟转换账本
pub mod conversion;

// 相册分批
pub mod album;

// 上传执行
pub mod uploader;

// 内容缓存
pub mod cache;

// 清理注册表
pub mod cleanup;

// 进程监督者
pub mod supervisor;

// 入站事件分类
pub mod intake;

// 出站消息适配器
pub mod messenger;

// 文件系统协作层
pub mod fsutil;

// 运行上下文
pub mod context;

// 导出常用类型
pub use config::AppConfig;
pub use context::{AppContext, StorageLayout};
pub use error::{TaskError, TaskResult};
pub use queue::{Acquired, FailOutcome, QueueEngine};
pub use task::{MediaKind, Stage, Task, TaskPayload};
