// Process assembly: configuration, store selection, coordinator
// construction, background tasks, and the axum server.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api;
use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::cors::cors_layer;
use crate::db::{migrations::run_migrations, pool::{check_pool_health, create_pg_pool, PoolConfig}};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::{self, ServerMetrics};
use crate::stats::StatsAggregator;
use crate::store::SessionStore;
use crate::ws;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

pub async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();

    let store = match &config.database_url {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize PostgreSQL pool")?;
            check_pool_health(&pool).await.context("PostgreSQL health check failed")?;
            run_migrations(&pool).await?;
            info!("session store: postgres");
            SessionStore::postgres(pool)
        }
        None => {
            warn!("CODEHIVE_DATABASE_URL is unset, using the in-memory session store");
            SessionStore::memory()
        }
    };

    metrics::set_global_metrics(Arc::new(ServerMetrics::default()));

    let stats = StatsAggregator::load_baseline(&store).await;
    let coordinator = Coordinator::new(store.clone(), stats.clone());

    // Background tasks: the debounced code writer, the periodic stats
    // cycle, and the daily stats snapshot.
    tokio::spawn(coordinator.saves.clone().run(store.clone()));
    tokio::spawn(stats.clone().run_recompute_loop(
        coordinator.presence.clone(),
        coordinator.rooms.clone(),
        store.clone(),
        config.stats_interval,
    ));
    tokio::spawn(stats.run_daily_snapshot_loop(store));

    let app = build_router(coordinator).layer(cors_layer());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting codehive server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")
}

/// Assemble every route plus the shared middleware stack. Exposed for the
/// integration tests, which run it against an in-memory store.
pub fn build_router(coordinator: Coordinator) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_handler))
            .merge(ws::router(coordinator.clone()))
            .merge(api::router(coordinator.store.clone())),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_handler() -> String {
    metrics::render_global()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response =
        with_request_id_scope(request_id.clone(), async move { next.run(request).await }).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
