//! 日志系统配置
//!
//! 控制台输出 + 文件持久化，文件按进程启动时间命名并每日滚动

use crate::config::LogConfig;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// 初始化日志系统
///
/// 返回的 guard 必须在 main 中持有到进程结束，否则文件日志缓冲不会刷写
pub fn init(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .compact();

    if config.to_file {
        fs::create_dir_all(&config.dir)?;
        let appender = tracing_appender::rolling::daily(&config.dir, "media-relay-rust.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer.boxed())
            .with(file_layer.boxed())
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer.boxed())
            .init();
        Ok(None)
    }
}
