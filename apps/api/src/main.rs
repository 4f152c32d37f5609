use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, Method};
use reelhouse_api::config::Config;
use reelhouse_api::{build_router, AppState, InFlightLimiter, RateLimitState, TokenVerifier};
use reelhouse_worker::jobs::{FfmpegSegmenter, UnconfiguredCatalog};
use reelhouse_worker::media::PgMediaIndex;
use reelhouse_worker::{
    build_registry, connect_pool, JobRuntime, JobServices, JobStore, PgJobStore, ResourceLeases,
    StatusPublisher,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the CORS layer based on configuration.
///
/// In production mode:
/// - If `CORS_ALLOWED_ORIGINS` is set, only those origins are allowed
/// - Otherwise CORS requests are rejected (no origins allowed)
///
/// In development mode:
/// - If `CORS_ALLOWED_ORIGINS` is set, those origins are used
/// - Otherwise permissive CORS is used for convenience
fn build_cors_layer(config: &Config) -> CorsLayer {
    match &config.cors_allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed_origins: Vec<_> = origins
                .iter()
                .filter_map(|origin| {
                    origin.parse().ok().or_else(|| {
                        tracing::warn!("Invalid CORS origin '{}', skipping", origin);
                        None
                    })
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::error!("No valid CORS origins configured, CORS requests will be rejected");
                CorsLayer::new()
            } else {
                tracing::info!(
                    "CORS configured with {} allowed origin(s): {:?}",
                    allowed_origins.len(),
                    origins
                );
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([
                        header::AUTHORIZATION,
                        header::CONTENT_TYPE,
                        header::ACCEPT,
                        header::ORIGIN,
                    ])
                    .allow_credentials(true)
                    .max_age(std::time::Duration::from_secs(3600))
            }
        }
        _ if config.is_production() => {
            tracing::warn!(
                "CORS_ALLOWED_ORIGINS not configured in production mode. \
                 CORS requests will be rejected."
            );
            CorsLayer::new()
        }
        _ => {
            tracing::warn!("Using permissive CORS in development mode");
            CorsLayer::permissive()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    reelhouse_shared_config::load_dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reelhouse_api=info,reelhouse_worker=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load API configuration")?;
    tracing::info!("Starting Reelhouse API server on port {}", config.port);

    tracing::info!(database = %config.database().redacted_url(), "Connecting to database...");
    let pool = connect_pool(config.database())
        .await
        .context("failed to connect to database")?;
    tracing::info!("Database connection established");

    let pg_store = PgJobStore::new(pool.clone(), config.jobs.backoff);
    pg_store.migrate().await.context("failed to run migrations")?;
    tracing::info!("Migrations completed successfully");
    let store: Arc<dyn JobStore> = Arc::new(pg_store);

    let publisher = StatusPublisher::new();
    let leases = ResourceLeases::new(config.jobs.resource_lease_timeout);
    let media = &config.common.media;

    let runtime = if config.embedded_workers {
        let services = JobServices {
            media: Arc::new(PgMediaIndex::new(pool)),
            catalog: Arc::new(UnconfiguredCatalog),
            segmenter: Arc::new(FfmpegSegmenter::from_config(media)),
            leases: leases.clone(),
            media_dir: media.media_dir.clone(),
            hls_root: media.hls_root(),
        };
        let runtime = JobRuntime::new(
            Arc::clone(&store),
            build_registry(&services),
            publisher.clone(),
            config.jobs.clone(),
        );
        Some(runtime.start())
    } else {
        tracing::info!("Embedded workers disabled; jobs run in a separate worker process");
        None
    };

    let tokens = TokenVerifier::new(&config.jwt_secret);
    let shutdown = CancellationToken::new();
    let state = AppState::new(store, publisher, leases, tokens.clone(), media.hls_root())
        .with_max_attempts(config.jobs.max_attempts)
        .with_stream_refresh(config.jobs.poll_interval)
        .with_shutdown(shutdown.clone());

    let in_flight = InFlightLimiter::new(config.max_in_flight);
    let limits = RateLimitState::new(&config.rate_limit, tokens);
    if limits.policy.is_disabled() {
        tracing::info!("Rate limiting disabled");
    }

    let app = build_router(state, in_flight, limits).layer(build_cors_layer(&config));

    // Run the server with ConnectInfo to capture client addresses
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    if let Some(handle) = runtime {
        tracing::info!("Waiting for running jobs");
        handle.shutdown().await;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, after cancelling `shutdown` so open
/// status streams close and the connection drain can finish
async fn shutdown_signal(shutdown: CancellationToken) {
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
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
