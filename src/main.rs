pub mod adaptor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pricing;
pub mod relay;
pub mod task;
pub mod util;

#[cfg(test)]
mod testing;

use adaptor::passthrough::{PassthroughAdaptor, build_http_client};
use adaptor::{AdaptorRegistry, ApiType};
use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use ledger::QuotaLedger;
use ledger::store::FileAccountStore;
use pricing::{PricingHandle, PricingTable};
use relay::context::ChannelSettings;
use relay::handler::AppState;
use relay::orchestrator::VideoRelay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use task::store::FileTaskStore;
use task::{TaskPlatform, TaskRecorder};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let accounts = Arc::new(FileAccountStore::new(&cfg.data_dir));
    match accounts.load().await {
        Ok(n) => tracing::info!("已加载 {n} 个额度账户"),
        Err(e) => tracing::warn!("加载 accounts.json 失败: {e:#}"),
    }

    let tasks = Arc::new(FileTaskStore::new(&cfg.data_dir));
    match tasks.load().await {
        Ok(n) => tracing::info!("已加载 {n} 条任务记录"),
        Err(e) => tracing::warn!("加载 tasks.jsonl 失败: {e:#}"),
    }

    // 价格表：环境变量为底，pricing.json 覆盖并热加载。
    let base_pricing = PricingTable::from_config(&cfg);
    let pricing = PricingHandle::new(base_pricing.clone());
    pricing::spawn_reload_task(
        pricing.clone(),
        base_pricing,
        cfg.pricing_file(),
        Duration::from_secs(cfg.pricing_reload_secs),
    );

    let http = build_http_client(&cfg).context("初始化上游 HTTP 客户端失败")?;
    let platform = TaskPlatform::parse(&cfg.upstream_platform).unwrap_or_else(|| {
        tracing::warn!(platform = %cfg.upstream_platform, "未知的任务平台，按 ali 处理");
        TaskPlatform::Ali
    });
    let log_level = cfg.log_level();

    let mut registry = AdaptorRegistry::new();
    registry.register(ApiType::Passthrough, move || {
        Box::new(PassthroughAdaptor::new(http.clone(), platform, log_level))
    });
    if registry.resolve(&cfg.upstream_api_type).is_none() {
        tracing::warn!(
            api_type = %cfg.upstream_api_type,
            "上游接口类型没有可用的适配器，视频请求将返回 invalid_api_type"
        );
    }

    let relay = VideoRelay::new(
        registry,
        pricing,
        QuotaLedger::new(accounts.clone(), cfg.quota_per_unit),
        TaskRecorder::new(tasks.clone()),
    );

    let state = Arc::new(AppState {
        log_level,
        channel: ChannelSettings::from_config(&cfg),
        relay,
        accounts,
        tasks,
    });

    let app = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/v1/video/generations",
            post(relay::handler::handle_video_submit),
        )
        .route(
            "/v1/video/generations/{task_id}",
            get(relay::handler::handle_video_fetch),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库日志默认 warn，本项目日志至少 info；DEBUG=off 时只保留 warn 及以上。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("warn")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,videorelay=info")
        } else if env.contains("videorelay") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},videorelay=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
