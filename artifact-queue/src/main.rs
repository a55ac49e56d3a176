use std::sync::Arc;

use artifact_queue::api::{ApiServer, AppState};
use artifact_queue::config::{AppConfig, BacklogBackend};
use artifact_queue::database;
use artifact_queue::logging;
use artifact_queue::pipeline::{
    BacklogRepository, JsonFileBacklog, PipelineQueue, QueueStores, SqliteBacklog,
};
use artifact_queue::stores::SqliteStores;
use job_runner::JobRunner;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default();
    let _log_guard = logging::init_logging(&config.logging)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let stores = Arc::new(SqliteStores::new(pool.clone()));
    let backlog: Arc<dyn BacklogRepository> = match config.backlog_backend {
        BacklogBackend::Json => Arc::new(JsonFileBacklog::new(&config.queue_state_path)),
        BacklogBackend::Sqlite => Arc::new(SqliteBacklog::new(pool.clone())),
    };

    let runner = Arc::new(JobRunner::with_config(config.runner.clone()));
    let queue = PipelineQueue::new(
        runner.clone(),
        config.queue.clone(),
        QueueStores {
            artifacts: stores.clone(),
            statuses: stores.clone(),
            external_ids: stores,
        },
        backlog,
    );
    queue.start().await;

    let shutdown = CancellationToken::new();
    spawn_purge_task(runner, config.job_retention, shutdown.clone());

    let server = ApiServer::new(config.api.clone(), AppState::new(queue));
    let server_token = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        server_token.cancel();
    });

    tracing::info!("artifact-queue initialized successfully");
    server.run().await?;
    shutdown.cancel();

    Ok(())
}

/// Periodically forget terminal process jobs so the runner does not grow
/// without bound.
fn spawn_purge_task(
    runner: Arc<JobRunner>,
    retention: std::time::Duration,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    runner.purge_terminal(retention);
                }
            }
        }
    });
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
