use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

use tunebridge::catalog::postgrest::PostgrestCatalogStore;
use tunebridge::catalog::{CatalogDefaults, CatalogStore};
use tunebridge::core::clock::{Clock, SystemClock};
use tunebridge::core::config::{AppConfig, ListingBackend};
use tunebridge::core::shutdown::{ShutdownCoordinator, SHUTDOWN_TIMEOUT_SECS};
use tunebridge::delivery::router::{self, AppState};
use tunebridge::observability::metrics as obs_metrics;
use tunebridge::storage::b2::{self, B2Authorizer, B2Downloader, B2NativeLister};
use tunebridge::storage::token::TokenCache;
use tunebridge::storage::{ObjectDownloader, ObjectLister};
use tunebridge::sync::BucketReconciler;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration (layered: default.toml → {env}.toml → env vars)
    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    // Must be installed before any metrics are recorded.
    let metrics_handle = match obs_metrics::install_prometheus_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "metrics initialization failed");
            return ExitCode::FAILURE;
        }
    };
    obs_metrics::describe_all_metrics();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config.describe(),
        "tunebridge starting"
    );

    match run(config, metrics_handle).await {
        Ok(()) => {
            info!("graceful shutdown completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tunebridge terminated with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig, metrics_handle: PrometheusHandle) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let request_timeout = Duration::from_secs(config.provider.request_timeout_secs);

    // Object store: one credential cache shared by download and native listing.
    let http = b2::build_http_client(request_timeout)?;
    let authorizer = Arc::new(B2Authorizer::new(http.clone(), &config.provider));
    let tokens = Arc::new(TokenCache::with_ttl(
        authorizer,
        clock.clone(),
        chrono::Duration::seconds(config.provider.credential_ttl_secs as i64),
    ));
    let downloader: Arc<dyn ObjectDownloader> = Arc::new(B2Downloader::new(
        http.clone(),
        tokens.clone(),
        config.provider.bucket_name.clone(),
    ));
    let lister = build_lister(&config, http, tokens)?;

    // Record storage
    let catalog: Arc<dyn CatalogStore> =
        Arc::new(PostgrestCatalogStore::new(&config.catalog, request_timeout)?);

    let reconciler = BucketReconciler::new(
        lister,
        catalog,
        clock,
        config.provider.public_base_url.clone(),
    )
    .with_defaults(CatalogDefaults::from_config(&config.catalog))
    .with_concurrency(config.sync.concurrency);

    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HTTP bind address")?;

    let start_time = Instant::now();
    let state = AppState::new(downloader, Arc::new(reconciler), config)
        .with_metrics_handle(metrics_handle);
    let app = router::build_router(state);

    let uptime_cancel = shutdown.token();
    tokio::spawn(async move {
        obs_metrics::run_uptime_task(start_time, uptime_cancel).await;
    });

    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    info!(%http_addr, "HTTP server listening");

    let shutdown_token = shutdown.token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
            })
            .await
    });

    shutdown.wait_for_signal_and_shutdown().await;
    info!("draining HTTP server ({SHUTDOWN_TIMEOUT_SECS}s timeout)");

    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), server).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(anyhow::anyhow!("HTTP server error: {e}")),
        Ok(Err(e)) => Err(anyhow::anyhow!("HTTP server task failed: {e}")),
        Err(_) => anyhow::bail!("shutdown timed out after {SHUTDOWN_TIMEOUT_SECS}s"),
    }
}

/// Pick the listing backend named in the configuration.
fn build_lister(
    config: &AppConfig,
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
) -> anyhow::Result<Arc<dyn ObjectLister>> {
    match config.provider.listing {
        ListingBackend::Native => Ok(Arc::new(B2NativeLister::new(
            http,
            tokens,
            &config.provider,
            config.sync.page_size,
        ))),
        #[cfg(feature = "s3")]
        ListingBackend::S3 => Ok(Arc::new(tunebridge::storage::s3::S3ObjectLister::new(
            &config.provider,
            config.sync.page_size,
        ))),
        #[cfg(not(feature = "s3"))]
        ListingBackend::S3 => anyhow::bail!("listing backend `s3` requires the `s3` feature"),
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
