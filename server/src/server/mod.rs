//! HTTP server assembly

mod routes;

pub use routes::{
    ClearSessionsResponse, ResetSessionsResponse, WsImagesResponse, gateway_routes,
};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dataset::DatasetCatalog;
use crate::error::GatewayError;
use crate::proxy::TileProxy;
use crate::reset::BulkResetCoordinator;
use crate::session::SessionManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub catalog: Arc<DatasetCatalog>,
    pub proxy: Arc<TileProxy>,
    pub reset: Arc<BulkResetCoordinator>,
    pub started: Instant,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, catalog: Arc<DatasetCatalog>) -> Self {
        Self {
            proxy: Arc::new(TileProxy::new(sessions.clone(), catalog.clone())),
            reset: Arc::new(BulkResetCoordinator::new(sessions.clone())),
            sessions,
            catalog,
            started: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    shards: usize,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let shards = state.sessions.shards().len();
    let (status, http_status) = if shards > 0 {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            shards,
            uptime_seconds: state.uptime_seconds(),
        }),
    )
}

#[derive(Serialize)]
struct MetricsResponse {
    uptime_seconds: u64,
    version: &'static str,
    /// Sessions currently recorded in the store
    live_sessions: usize,
    shards: usize,
    datasets: usize,
}

async fn stats(State(state): State<AppState>) -> Result<Json<MetricsResponse>, GatewayError> {
    let sessions = state.sessions.list_all_sessions().await.map_err(|e| {
        tracing::error!("Failed to list sessions: {}", e);
        e
    })?;

    Ok(Json(MetricsResponse {
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION"),
        live_sessions: sessions.len(),
        shards: state.sessions.shards().len(),
        datasets: state.catalog.len(),
    }))
}

/// Full application router: health, stats and the gateway API
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(stats))
        .with_state(state.clone())
        .merge(gateway_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
