use std::sync::Arc;

use anyhow::Context;
use reelhouse_worker::config::Config;
use reelhouse_worker::jobs::{FfmpegSegmenter, UnconfiguredCatalog};
use reelhouse_worker::media::PgMediaIndex;
use reelhouse_worker::{
    build_registry, connect_pool, JobRuntime, JobServices, PgJobStore, ResourceLeases,
    StatusPublisher,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    reelhouse_shared_config::load_dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reelhouse_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load worker configuration")?;
    tracing::info!(
        environment = ?config.common.environment,
        workers = config.jobs.worker_count,
        "Starting Reelhouse worker"
    );

    let pool = connect_pool(&config.common.database)
        .await
        .context("failed to connect to database")?;
    let store = PgJobStore::new(pool.clone(), config.jobs.backoff);
    store.migrate().await.context("failed to run migrations")?;
    tracing::info!("Migrations completed");

    let services = JobServices {
        media: Arc::new(PgMediaIndex::new(pool)),
        catalog: Arc::new(UnconfiguredCatalog),
        segmenter: Arc::new(FfmpegSegmenter::from_config(&config.common.media)),
        leases: ResourceLeases::new(config.jobs.resource_lease_timeout),
        media_dir: config.common.media.media_dir.clone(),
        hls_root: config.common.media.hls_root(),
    };

    let runtime = JobRuntime::new(
        Arc::new(store),
        build_registry(&services),
        StatusPublisher::new(),
        config.jobs,
    );
    let handle = runtime.start();

    shutdown_signal().await;
    tracing::info!("Shutdown requested, waiting for running jobs");
    handle.shutdown().await;
    tracing::info!("Worker stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
