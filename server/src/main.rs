use axum::{Router, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wsi_gateway::config::{Config, SessionConfig};
use wsi_gateway::session::SessionManagerConfig;
use wsi_gateway::{
    AppState, DatasetCatalog, GatewayError, HttpShardClient, InMemorySessionStore, SessionManager,
    SessionStore, ShardDirectory, build_router,
};

/// Prometheus metrics handle for exposing metrics in Prometheus format
static PROMETHEUS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Initialize the Prometheus metrics recorder
fn setup_prometheus_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Endpoint to expose metrics in Prometheus format
async fn prometheus_metrics() -> impl IntoResponse {
    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Pick the session store named by `SESSION_STORE_URL`
async fn build_store(session: &SessionConfig) -> Result<Arc<dyn SessionStore>, GatewayError> {
    if session.store_url == "memory" {
        info!("Using in-memory session store (single instance only)");
        return Ok(Arc::new(InMemorySessionStore::with_ttl(session.ttl)));
    }

    #[cfg(feature = "redis-store")]
    if session.store_url.starts_with("redis://") || session.store_url.starts_with("rediss://") {
        info!("Using Redis session store");
        let store =
            wsi_gateway::session::RedisSessionStore::connect(&session.store_url, session.ttl)
                .await?;
        return Ok(Arc::new(store));
    }

    Err(GatewayError::Configuration(format!(
        "unsupported SESSION_STORE_URL: {}",
        session.store_url
    )))
}

/// Update gauge metrics (called periodically)
async fn update_gauge_metrics(state: &AppState) {
    match state.sessions.list_all_sessions().await {
        Ok(sessions) => {
            metrics::gauge!("wsigateway_sessions_active").set(sessions.len() as f64);
        }
        Err(e) => warn!("Failed to count sessions: {}", e),
    }
    metrics::gauge!("wsigateway_uptime_seconds").set(state.uptime_seconds() as f64);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must be installed before any metrics are recorded
    let prometheus_handle = setup_prometheus_metrics();
    PROMETHEUS_HANDLE.set(prometheus_handle).ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsi_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    config.validate()?;
    info!(
        "Loaded configuration: host={}, port={}, shards={}",
        config.host,
        config.port,
        config.shards.len()
    );
    for shard in &config.shards {
        info!("Shard {} at {}", shard.id, shard.base_url);
    }

    let mount_root: PathBuf = config.mount_root.clone().unwrap_or_default();
    if !mount_root.is_dir() {
        warn!("Mount root {:?} is not a directory", mount_root);
    }

    let datasets = config.load_datasets()?;
    if datasets.is_empty() {
        warn!("No datasets configured - every image request will be rejected");
    }
    let catalog = Arc::new(DatasetCatalog::new(mount_root.clone(), datasets));

    let shards = Arc::new(ShardDirectory::new(config.shards.clone())?);
    let client = Arc::new(HttpShardClient::new(config.timeouts)?);
    let store = build_store(&config.session).await?;
    let sessions = Arc::new(SessionManager::with_config(
        shards,
        store,
        client,
        mount_root,
        SessionManagerConfig {
            liveness_grace: config.session.liveness_grace,
        },
    ));

    let app_state = AppState::new(sessions, catalog);

    // Periodic teardown of idle sessions
    let idle_timeout = config.session.idle_timeout;
    let janitor_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match janitor_state.sessions.reap_idle(idle_timeout).await {
                Ok(0) => {}
                Ok(n) => info!("Reaped {} idle sessions", n),
                Err(e) => error!("Idle session sweep failed: {}", e),
            }
        }
    });

    // Periodic update of gauge metrics (every 5 seconds)
    let metrics_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            update_gauge_metrics(&metrics_state).await;
        }
    });

    let app = Router::new()
        .route("/metrics/prometheus", get(prometheus_metrics))
        .merge(build_router(app_state));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("WSI gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
