//! Themis - judge worker binary
//!
//! Recovers interrupted work, then judges PENDING submissions from the
//! database until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use themis::config::Config;
use themis::metrics::MetricsServer;
use themis::recovery;
use themis::sandbox::ProcessSandbox;
use themis::scheduler::JudgeService;
use themis::store::PgStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "themis=debug,sqlx=warn".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting Themis judge");
    tracing::info!("Environment: {}", config.environment);

    // Create database pool
    tracing::info!("Connecting to database...");
    let store = PgStore::connect(
        config.require_database_url()?,
        config.database_max_connections,
    )
    .await?;
    tracing::info!("Database connected");

    if config.run_migrations {
        store.migrate().await?;
        tracing::info!("Migrations applied");
    }

    // Start metrics server
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = MetricsServer::run(metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let sandbox = ProcessSandbox::new(config.sandbox.clone())?;
    sandbox.self_check().await?;
    let service = Arc::new(JudgeService::new(
        config.scheduler.clone(),
        config.intake.clone(),
        Arc::new(store),
        Arc::new(sandbox),
    ));

    let stale_after = Duration::from_secs(config.scheduler.stale_running_after_secs);
    recovery::recover(&service, stale_after).await?;

    service.start();
    let poller = tokio::spawn(recovery::poll_pending(
        service.clone(),
        Duration::from_millis(config.scheduler.pending_poll_interval_ms),
    ));
    let sweeper = tokio::spawn(recovery::sweep_stats(
        service.clone(),
        Duration::from_secs(config.scheduler.stats_sweep_interval_secs),
    ));

    tracing::info!("Themis ready, judging submissions");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, finishing in-flight judgments...");

    service.shutdown().await;
    poller.abort();
    sweeper.abort();

    tracing::info!("Themis shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
