use anyhow::Context as _;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use wxpad::adapters::{self, POLL_TIMEOUT, SourceParams};
use wxpad::channel::Channel;
use wxpad::clock::{Clock, SystemClock};
use wxpad::config::{AppConfig, SharedConfig};
use wxpad::dispatch::Dispatcher;
use wxpad::gateway::HttpGateway;
use wxpad::group::GroupStore;
use wxpad::login::{self, BotIdentity, LoginOptions, LoginRecord};
use wxpad::outbound::Outbound;
use wxpad::pipeline::Pipeline;
use wxpad::pool::WorkerPool;
use wxpad::scheduler::Scheduler;
use wxpad::transcode::FfmpegTranscoder;
use wxpad::{log, media, plugins, reply};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const FLUSH_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "config.toml".to_string()),
    );

    let mut cfg = AppConfig::load_or_init(&config_path)
        .await
        .with_context(|| format!("无法加载配置 {}", config_path.display()))?;
    log::init(&cfg.log_level);
    info!(target: "System", "配置已加载: {}", config_path.display());

    if plugins::register_defaults(&mut cfg) {
        cfg.save(&config_path).await?;
    }
    let config: SharedConfig = Arc::new(RwLock::new(cfg));
    let snapshot = config.read().clone();

    let adapter = adapters::find_adapter(&snapshot.gateway.protocol_version).with_context(|| {
        format!("不支持的协议版本: {}", snapshot.gateway.protocol_version)
    })?;
    info!(
        target: "System",
        "协议 {} ({})，网关 {}:{}",
        adapter.protocol,
        adapter.description,
        snapshot.gateway.host,
        snapshot.gateway.port
    );

    // ================== 登录 ==================
    let gateway = Arc::new(HttpGateway::new(&snapshot.gateway)?);
    login::ensure_key(gateway.as_ref(), &config, &config_path).await?;

    let record_path = snapshot.data_dir.join("login.json");
    if let Some(previous) = LoginRecord::load(&record_path).await {
        info!(target: "Login", "上次登录账号: {} ({})", previous.nickname, previous.wxid);
    }
    let profile = login::login(gateway.as_ref(), &LoginOptions::from_config(&snapshot.gateway))
        .await
        .context("登录失败")?;
    info!(target: "Login", "登录成功: {} ({})", profile.nickname, profile.wxid);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let record = LoginRecord::new(&profile, &snapshot.gateway.device_name, clock.now());
    if let Err(e) = record.save(&record_path).await {
        warn!(target: "Login", "保存登录记录失败: {}", e);
    }
    let identity = Arc::new(BotIdentity::new(&profile.wxid, &profile.nickname));

    // ================== 组装流水线 ==================
    let pool = Arc::new(WorkerPool::new(
        snapshot.channel.worker_count,
        snapshot.channel.queue_capacity,
    ));
    let store = Arc::new(GroupStore::load(
        snapshot.data_dir.join("rooms.json"),
        Duration::from_secs(snapshot.channel.group_cache_ttl_secs),
        clock.clone(),
    ));
    let outbound = Arc::new(Outbound::new(
        gateway.clone(),
        Arc::new(FfmpegTranscoder::from_config(&snapshot.media)),
        snapshot.media.temp_dir.clone(),
        snapshot.channel.group_at_sender,
    ));
    let dispatcher = Dispatcher::new(
        config.clone(),
        reply::from_config(&snapshot.reply)?,
        outbound,
        pool.clone(),
    );
    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        clock,
        identity.clone(),
        gateway.clone(),
        pool.clone(),
        store.clone(),
        dispatcher,
    ));
    pipeline.images().ensure_dirs().await?;

    // ================== 定时任务 ==================
    let scheduler = Scheduler::new();
    let retention = Duration::from_secs(snapshot.channel.image_retention_days * 24 * 3600);
    let image_dir = pipeline.images().dir().to_path_buf();
    sweep_images(&image_dir, retention).await;
    scheduler.add_interval(SWEEP_INTERVAL, move || {
        let dir = image_dir.clone();
        async move { sweep_images(&dir, retention).await }
    });

    let maintained = pipeline.clone();
    scheduler.add_interval(FLUSH_INTERVAL, move || {
        let pipeline = maintained.clone();
        async move {
            pipeline.filter().purge_expired();
            if let Err(e) = pipeline.groups().store().save().await {
                warn!(target: "Group", "保存群信息缓存失败: {}", e);
            }
        }
    });

    // ================== 接收循环 ==================
    let source = (adapter.build)(SourceParams {
        gateway: gateway.clone(),
        sync_url: gateway.sync_ws_url()?,
        timeout: POLL_TIMEOUT,
    });
    Channel::new(source, pipeline, gateway, identity)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(target: "System", "无法监听退出信号: {}", e);
                std::future::pending::<()>().await;
            }
            info!(target: "System", "收到退出信号，正在关闭...");
        })
        .await;

    scheduler.shutdown();
    pool.shutdown();
    if let Err(e) = store.save().await {
        error!(target: "Group", "保存群信息缓存失败: {}", e);
    }
    info!(target: "System", "已退出");
    Ok(())
}

async fn sweep_images(dir: &Path, retention: Duration) {
    match media::sweep(dir, retention).await {
        Ok((0, _)) => {}
        Ok((files, bytes)) => {
            info!(target: "Media", "已清理 {} 个过期图片 ({} 字节)", files, bytes)
        }
        Err(e) => warn!(target: "Media", "清理图片缓存失败: {}", e),
    }
}
