//! Cloud Code Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Google OAuth credentials from the account file
//! 2. Serves Gemini-style generation requests on the public listener
//! 3. Forwards each one to Cloud Code with a rotated, refreshed credential
//! 4. Exposes credential and rotation management on a separate admin listener

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use cloudcode_auth::{AuthClient, CredentialStore};
use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{Pool, spawn_refresh_task};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    pool: Arc<Pool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1beta/models", get(list_models_handler))
        .route(
            "/v1beta/models/{target}",
            get(model_handler).post(generate_handler),
        )
        .fallback(not_found_handler)
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

    info!("starting cloudcode-gateway");

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
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        upstream = %config.upstream.base_url,
        credentials = %config.credentials.path.display(),
        strategy = %config.rotation.strategy,
        request_count = config.rotation.request_count,
        api_key = config.api_key.is_some(),
        "configuration loaded"
    );
    if config.api_key.is_none() {
        warn!("API_KEY not set, generation endpoints accept any client");
    }

    let oauth_app = config.oauth_app().context(
        "OAuth client secret missing: set OAUTH_CLIENT_SECRET or oauth.client_secret_file",
    )?;

    let http = reqwest::Client::new();
    let auth = AuthClient::new(http.clone(), oauth_app, config.endpoints(), config.timeout());
    let store = Arc::new(CredentialStore::new(config.credentials.path.clone()));
    let pool = Arc::new(Pool::new(
        store,
        Arc::new(auth.clone()),
        config.pool_options(),
    ));

    // Load eagerly so the first request doesn't pay for startup refreshes
    pool.initialize().await;

    let refresh_task = spawn_refresh_task(
        pool.clone(),
        Duration::from_secs(config.credentials.refresh_interval_secs),
    );

    let proxy_state = ProxyState {
        pool: pool.clone(),
        client: http,
        base_url: config.upstream.base_url.clone(),
        models_url: config.upstream.models_url.clone(),
        user_agent: config.upstream.user_agent.clone(),
        timeout: config.timeout(),
        retry_times: config.upstream.retry_times,
        api_key: config.api_key.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        pool: pool.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(
        pool.clone(),
        auth,
        config.upstream.skip_project_id_fetch,
    ));

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    let admin_addr = config.server.admin_listen_addr;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;

    info!(addr = %listen_addr, admin_addr = %admin_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify both servers to drain, then race them against it.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async {
                let _ = admin_shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    let drained = tokio::time::timeout(
        DRAIN_TIMEOUT,
        futures_util::future::join(server_handle, admin_handle),
    )
    .await;
    match drained {
        Ok((server, admin)) => {
            for (name, outcome) in [("public", server), ("admin", admin)] {
                match outcome {
                    Ok(Ok(())) => info!(listener = name, "all in-flight requests drained"),
                    Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(task) = refresh_task {
        task.abort();
    }

    // Let queued credential writes land before exit
    pool.flush().await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus uptime. 503 when no credential is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health().await;
    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn generate_handler(
    State(state): State<AppState>,
    Path(target): Path<String>,
    request: Request<Body>,
) -> Response {
    let request_id = error::new_request_id();
    proxy::generate(&state.proxy, &target, request, request_id).await
}

async fn list_models_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = error::new_request_id();
    proxy::models(&state.proxy, None, request, request_id).await
}

async fn model_handler(
    State(state): State<AppState>,
    Path(model): Path<String>,
    request: Request<Body>,
) -> Response {
    let request_id = error::new_request_id();
    proxy::models(&state.proxy, Some(&model), request, request_id).await
}

async fn not_found_handler(request: Request<Body>) -> Response {
    error::Error::NotFound(format!("no route for {}", request.uri().path())).into_response()
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
