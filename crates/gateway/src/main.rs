//! bMINTY API Gateway
//!
//! HTTP entry point of the catalog.
//! Handles:
//! - Bulk import uploads and job status polling
//! - Filtered and full exports
//! - Snapshot restore
//! - Observability (logging, metrics, tracing)

mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use bminty_common::{
    config::AppConfig,
    db::DbPool,
    jobs::{EvictionPolicy, JobStore},
    metrics, ExportEngine, Repository, SnapshotService,
};
use bminty_ingestion::{BulkImporter, ImportLocks};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DbPool,
    pub jobs: Arc<JobStore>,
    pub importer: BulkImporter,
    pub exports: ExportEngine,
    pub snapshots: SnapshotService,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: DbPool) -> Self {
        let repo = Repository::new(db.clone());
        Self {
            jobs: Arc::new(JobStore::new(EvictionPolicy::from(&config.jobs))),
            importer: BulkImporter::new(repo, ImportLocks::new(), &config.import),
            exports: ExportEngine::new(db.clone(), config.export_dir()),
            snapshots: SnapshotService::new(db.clone(), config.backup_dir()),
            config,
            db,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting bMINTY API Gateway v{}", bminty_common::VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port))
            .set_buckets(metrics::DURATION_BUCKETS)?
            .install()?;
        info!("Metrics exporter on port {}", config.observability.metrics_port);
    }
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;

    // Create app state
    let state = AppState::new(config.clone(), db.clone());
    let sweeper = state
        .jobs
        .spawn_sweeper(Duration::from_secs(config.jobs.sweep_interval_secs.max(1)));

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Uploads may be far larger than the default body limit
    let upload_limit = DefaultBodyLimit::max(
        usize::try_from(state.config.server.max_upload_bytes).unwrap_or(usize::MAX),
    );

    let upload_routes = Router::new()
        .route("/imports", post(handlers::imports::submit_import))
        .route("/restore", post(handlers::restore::restore))
        .layer(upload_limit);

    // Uploads and downloads stream for as long as they need; the rest is bounded
    let quick_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/imports/{job_id}", get(handlers::imports::get_import))
        .layer(TimeoutLayer::new(state.config.request_timeout()));

    let api_routes = Router::new()
        .merge(upload_routes)
        .merge(quick_routes)
        .route("/export", get(handlers::export::export))
        .route("/export/full", get(handlers::export::export_full));

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
