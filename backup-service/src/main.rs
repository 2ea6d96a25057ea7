mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::services::backup_scheduler::BackupScheduler;
use crate::state::AppState;
use backup_pipeline::{utils, Config, Pipeline};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = AppConfig::from_env();
    let config = Config::load(app_config.backup_config.as_deref())?;
    utils::logger::init(&config.log.level)?;

    tracing::info!("Starting backup service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(config = ?config.redacted(), "Configuration");

    let pipeline = Pipeline::from_config(config).await?;

    // Store health is informational at startup
    let health = pipeline.store.check_health().await;
    let healthy = health.iter().filter(|h| h.healthy).count();
    if healthy < pipeline.store.replication_factor() {
        tracing::warn!(
            healthy,
            total = health.len(),
            required = pipeline.store.replication_factor(),
            "Store health check failed, continuing"
        );
    } else {
        tracing::info!(healthy, total = health.len(), "Store endpoints healthy");
    }

    {
        let mut ledger = pipeline.ledger.lock().await;
        ledger.load().await?;
        let stats = ledger.statistics();
        tracing::info!(
            backups = stats.total_backups,
            total_size = stats.total_size,
            "Manifest loaded"
        );
    }

    let state = Arc::new(AppState::new(pipeline));
    let cancel = CancellationToken::new();

    let scheduler = match BackupScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    if app_config.api_enabled {
        let app = routes::create_router(state.clone());
        let addr = format!("0.0.0.0:{}", app_config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await?;
    } else {
        tracing::info!("HTTP API disabled");
        shutdown_signal(cancel.clone()).await;
    }

    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    if let Some(active) = state.runs.active() {
        tracing::warn!(operation = %active.operation, "Exiting while a run is in progress");
    }
    tracing::info!("Service stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
