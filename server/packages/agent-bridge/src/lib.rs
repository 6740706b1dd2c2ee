use std::sync::Arc;

use app::build_router;
use config::BridgeConfig;
use process::{AgentRunner, ProcessRunner};
use reaper::IdleReaper;

pub mod app;
pub mod backends;
pub mod config;
pub mod process;
pub mod reaper;
pub mod routing;
pub mod sessions;

pub async fn run_server(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    run_server_with_runner(config, Arc::new(ProcessRunner::new())).await
}

pub async fn run_server_with_runner(
    config: BridgeConfig,
    runner: Arc<dyn AgentRunner>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = Arc::new(config.backend_router(runner)?);
    let addr = config.listen_addr()?;

    let reaper = IdleReaper::start(router.clone(), config.sweep_interval, config.idle_timeout);
    let app = build_router(router.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        default_backend = %router.default_backend(),
        backends = ?router.adapters().map(|adapter| adapter.kind()).collect::<Vec<_>>(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        serialize_turns = config.serialize_turns,
        "agent-bridge listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    reaper.stop().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
