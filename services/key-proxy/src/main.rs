//! Key Pool Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a set of interchangeable upstream API keys
//! 2. Listens for incoming requests
//! 3. Attaches a ready key to each request (Authorization: Bearer)
//! 4. Proxies upstream, resting keys that hit their rate limit

mod config;
mod error;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_pool::{KeyPool, Orchestrator, PoolCell};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    pool: Arc<KeyPool>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently handled requests; excess requests
/// queue in the limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        keys = config.pool.keys.len(),
        tick_ms = config.pool.tick_interval_ms,
        max_attempts = config.retry.max_attempts,
        "configuration loaded"
    );

    let pools = PoolCell::new();
    let pool = pools.get_or_init(config.pool.keys.iter().cloned(), config.pool.pool_config());
    if pool.is_empty().await {
        warn!("no API keys configured, proxied requests will fail with 503");
    }

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client: reqwest::Client::new(),
        upstream_url: config.proxy.upstream_url.clone(),
        timeout: Duration::from_secs(config.proxy.timeout_secs),
        orchestrator: Orchestrator::new(pool.clone(), config.retry_policy()),
        metrics: metrics.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        pool: pool.clone(),
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. the pool shuts down, so requests waiting for a key or backing off
    //    answer 503 right away instead of holding the drain open
    // 3. axum stops accepting new connections and drains in-flight requests
    // 4. DRAIN_TIMEOUT, counted from the signal, bounds the drain
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    pool.shutdown();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus service counters.
/// Returns 200 while at least one key is ready, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health().await;
    let ready = body["keys_ready"].as_u64().unwrap_or(0);
    let shutting_down = state.pool.is_shut_down();

    if let Some(fields) = body.as_object_mut() {
        fields.insert(
            "uptime_seconds".into(),
            state.metrics.started_at.elapsed().as_secs().into(),
        );
        fields.insert(
            "requests_served".into(),
            state.metrics.requests_total.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "errors_total".into(),
            state.metrics.errors_total.load(Ordering::Relaxed).into(),
        );
        if shutting_down {
            fields.insert("status".into(), "shutting_down".into());
        }
    }

    let status_code = if ready > 0 && !shutting_down {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-health requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
