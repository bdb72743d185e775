use crate::cli::Cli;
use crate::cloudwatch::CloudWatchSink;
use crate::metrics::{MonitorMetrics, RemoteSink};
use crate::podman::PodmanConnector;
use crate::state::{HealthState, MonitorContext};
use crate::webserver::AppState;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod cloudwatch;
mod config;
mod engine;
mod image_reference;
mod interval;
mod metrics;
mod monitor;
mod podman;
mod secret_string;
mod state;
mod steps;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Cancels `shutdown` once `signal` fires. A listener that fails to install
/// leaves the token untouched.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_source = cli.config_source();
    let config = cli.resolve_config()?;
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .init();
    info!("Starting registry-monitor {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {}", config_source);
    info!(
        "Testing {}/{} every {:?}",
        config.registry.host, config.registry.repository, config.run_test_every
    );

    let remote = CloudWatchSink::from_config(&config)
        .map(|sink| Arc::new(sink) as Arc<dyn RemoteSink>);
    let metrics = Arc::new(
        MonitorMetrics::new(&config.prometheus.namespace, remote)
            .context("Failed to register prometheus metrics")?,
    );
    let connector = Arc::new(PodmanConnector::new(&config.engine)?);
    let health = Arc::new(HealthState::new());
    let listen = config.listen;

    let ctx = MonitorContext {
        config: Arc::new(config),
        connector,
        metrics: metrics.clone(),
        health: health.clone(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    let mut monitor = tokio::spawn(monitor::run(ctx, shutdown.clone()));

    let app = webserver::create_app(AppState { health, metrics });
    info!("Starting webserver on {}", listen);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    tokio::select! {
        served = &mut server => {
            shutdown.cancel();
            served.context("Webserver task panicked")??;
            return Ok(());
        }
        finished = &mut monitor => {
            match finished.context("Monitor task panicked")? {
                Ok(()) if !shutdown.is_cancelled() => {
                    warn!("Monitor halted; still serving health and metrics")
                }
                Ok(()) => {}
                Err(e) => {
                    error!("Monitor failed: {:#}", e);
                    shutdown.cancel();
                    server.await.context("Webserver task panicked")??;
                    return Err(e);
                }
            }
        }
    }

    server.await.context("Webserver task panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn test_signal_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(async { Ok(()) }, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_running() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(
            async { Err(io::Error::other("signal driver unavailable")) },
            shutdown.clone(),
        )
        .await;
        assert!(!shutdown.is_cancelled());
    }
}
