use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use media_relay_rust::config::AppConfig;
use media_relay_rust::context::{AppContext, StorageLayout};
use media_relay_rust::conversion::ConversionLedger;
use media_relay_rust::extractor::SecretGate;
use media_relay_rust::messenger::{updates, BotApiMessenger, Messenger, Notifier};
use media_relay_rust::queue::{workers, QueueEngine};
use media_relay_rust::supervisor::{
    self, AdmissionGate, CurrentOp, LockError, PauseSwitch, SingletonLock,
    EXIT_CODE_ALREADY_RUNNING,
};
use media_relay_rust::task::Stage;
use media_relay_rust::{cache::ContentCache, cleanup::CleanupRegistry, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match AppConfig::load(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置加载失败: {:#}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match logging::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("日志初始化失败: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("media-relay-rust 启动 (配置: {:?})", config_path);

    let layout = StorageLayout::from(&config);
    if let Err(e) = layout.prepare() {
        error!("数据目录初始化失败: {}", e);
        std::process::exit(1);
    }

    // 单例锁：另一实例存活时以专用退出码退出
    let _lock = match SingletonLock::acquire(&layout.lock_path()) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning(pid)) => {
            error!("另一实例已在运行 (PID {})，退出", pid);
            std::process::exit(EXIT_CODE_ALREADY_RUNNING);
        }
        Err(LockError::Io(e)) => {
            error!("单例锁获取失败: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, layout).await {
        error!("运行失败: {:#}", e);
        std::process::exit(1);
    }

    info!("media-relay-rust 正常退出");
}

async fn run(config: AppConfig, layout: StorageLayout) -> Result<()> {
    // 引擎打开即完成日志回放与相册重组
    let engine = Arc::new(
        QueueEngine::open(
            &layout,
            config.queue.compact_threshold,
            config.album.size_cap,
        )
        .context("队列引擎初始化失败")?,
    );

    let cache = Arc::new(ContentCache::load(layout.cache_path()));
    let ledger = Arc::new(ConversionLedger::load(
        layout.conversions_path(),
        config.conversion.state_save_interval_secs,
        config.conversion.max_retries,
    ));
    let registry = Arc::new(CleanupRegistry::new());

    let api = Arc::new(BotApiMessenger::new(&config.messenger, &config.fetch));
    let messenger: Arc<dyn Messenger> = api.clone();
    let notifier = Arc::new(Notifier::new(
        messenger.clone(),
        config.messenger.progress_min_pct_step,
        config.messenger.progress_min_interval_secs,
    ));

    let ctx = Arc::new(AppContext {
        gate: AdmissionGate::new(true),
        upload_pause: PauseSwitch::new(),
        secret_gate: Arc::new(SecretGate::new()),
        current_op: Arc::new(CurrentOp::new()),
        cancel: CancellationToken::new(),
        config,
        layout,
        engine,
        cache,
        registry,
        ledger,
        messenger,
        notifier,
    });

    // 启动恢复：清单登记、引用计数重建、账本扫描
    supervisor::restore_state(&ctx).context("启动恢复失败")?;

    // 出站连通性验证（认证失效早发现）
    match ctx.messenger.resolve_target().await {
        Ok(id) => info!("出站目标可用: {}", id),
        Err(e) => error!("出站目标解析失败（运行中重试）: {}", e),
    }

    let mut handles = Vec::new();

    // 阶段工作线程
    for slot in 0..ctx.config.queue.download_concurrency {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            workers::run_stage_worker(ctx, Stage::Download, slot).await;
        }));
    }
    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            workers::run_stage_worker(ctx, Stage::Process, 0).await;
        }));
    }
    for slot in 0..ctx.config.queue.upload_concurrency {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            workers::run_stage_worker(ctx, Stage::Upload, slot).await;
        }));
    }

    // 延迟转换排水
    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            workers::run_deferred_worker(ctx).await;
        }));
    }

    // 重试泵与快照循环
    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            supervisor::run_retry_pump(ctx).await;
        }));
    }
    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            supervisor::run_snapshot_loop(ctx).await;
        }));
    }

    // 入站更新循环
    {
        let ctx = ctx.clone();
        let api = api.clone();
        handles.push(tokio::spawn(async move {
            updates::run_update_loop(ctx, api).await;
        }));
    }

    info!("全部工作线程已启动，等待关停信号");
    tokio::signal::ctrl_c()
        .await
        .context("等待关停信号失败")?;

    info!("收到关停信号，开始优雅退出");
    ctx.cancel.cancel();
    for handle in handles {
        handle.await.ok();
    }

    Ok(())
}
