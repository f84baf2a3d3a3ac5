//! 主应用程序入口
//!
//! 启动实时中继服务：WebSocket 通道与内部通知接口。

use std::sync::Arc;

use anyhow::Context;
use application::memory::{InMemoryStore, SeedData};
use application::{HubDependencies, RealtimeHub, SystemClock};
use config::AppConfig;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(config = %config.sanitize(), "configuration loaded");

    let store = Arc::new(InMemoryStore::new());
    if let Some(path) = &config.seed.file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read seed file {path}"))?;
        let seed = SeedData::from_json(&text).context("invalid seed file")?;
        let loaded = store.apply_seed(seed, chrono::Utc::now()).await?;
        tracing::info!(conversations = loaded, path = %path, "seed data loaded");
    }

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let hub = RealtimeHub::new(HubDependencies {
        identity: jwt_service.clone(),
        store: store.store(),
        clock: Arc::new(SystemClock),
        settings: config.realtime.clone(),
    });

    let app = router(AppState::new(hub.clone(), jwt_service));
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!("实时中继服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

/// 收到 Ctrl+C 后先关闭全部实时连接，再让 HTTP 服务优雅退出
async fn shutdown_signal(hub: RealtimeHub) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
    hub.shutdown();
}
