//! HTTP route handlers for the viewer-facing gateway API

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::{delete, get, post},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::AppState;
use crate::dataset::{FsOverlayProvider, ImageRef};
use crate::error::GatewayError;
use crate::proxy::{TileRequest, parse_tile_address};
use crate::session::{ImageKey, Overlay, ReleaseOutcome};

/// Query of `GET /tile/...`
#[derive(Debug, Deserialize)]
pub struct TileQuery {
    pub wsi_image: Option<String>,
    pub genome: Option<String>,
    pub dslabel: Option<String>,
    pub sample_id: Option<String>,
    pub ai_project_id: Option<String>,
    pub client_ref: Option<String>,
}

/// Query of `/wsimages`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsImagesQuery {
    pub genome: Option<String>,
    pub dslabel: Option<String>,
    pub sample_id: Option<String>,
    pub wsimage: Option<String>,
    #[serde(alias = "aiProjectWSIId")]
    pub ai_project_id: Option<String>,
    #[serde(alias = "client_ref")]
    pub client_ref: Option<String>,
}

/// Response for `/wsimages`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsImagesResponse {
    pub status: String,
    /// Shard-side token the viewer embeds in tile URLs
    pub wsi_session_id: String,
    pub image_key: String,
    pub client_ref: String,
    pub overlays: Vec<Overlay>,
    #[serde(rename = "slide_dimensions")]
    pub slide_dimensions: [u64; 2],
}

#[derive(Debug, Deserialize)]
pub struct ClearSessionsQuery {
    /// JSON array of `[imageKey, clientRef]` pairs
    pub sessions: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearSessionsResponse {
    pub status: String,
    /// References that were actually held and dropped
    pub released: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetSessionsResponse {
    pub status: String,
    pub attempted: usize,
    pub failed: usize,
}

fn image_ref(
    sample_id: Option<String>,
    ai_project_id: Option<String>,
    wsimage: Option<String>,
) -> Result<ImageRef, GatewayError> {
    let wsimage = wsimage
        .filter(|w| !w.is_empty())
        .ok_or_else(|| GatewayError::InvalidInput("missing wsimage".to_string()))?;
    match (sample_id, ai_project_id) {
        (Some(sample_id), _) if !sample_id.is_empty() => {
            Ok(ImageRef::Sample { sample_id, wsimage })
        }
        (_, Some(project_id)) if !project_id.is_empty() => {
            Ok(ImageRef::AiProject { project_id, wsimage })
        }
        _ => Err(GatewayError::InvalidInput(
            "missing sample id or AI project id".to_string(),
        )),
    }
}

/// GET /tile/:layer/:token/zoomify/:group/:file - Proxy one tile
pub async fn get_tile(
    State(state): State<AppState>,
    Path((layer, token, tile_group, file)): Path<(String, String, String, String)>,
    Query(query): Query<TileQuery>,
) -> Result<Response, GatewayError> {
    let tile = parse_tile_address(&layer, &tile_group, &file)?;
    let request = TileRequest {
        genome: query.genome,
        dslabel: query.dslabel,
        image: image_ref(query.sample_id, query.ai_project_id, query.wsi_image)?,
        client_ref: query.client_ref.filter(|r| !r.is_empty()),
        viewer_token: token,
        tile,
    };
    state.proxy.proxy(&request).await
}

/// GET|POST /wsimages - Open (or join) the session for an image
pub async fn open_wsimage(
    State(state): State<AppState>,
    Query(query): Query<WsImagesQuery>,
) -> Result<Json<WsImagesResponse>, GatewayError> {
    let image = image_ref(query.sample_id, query.ai_project_id, query.wsimage)?;
    let resolved = state
        .catalog
        .resolve(query.genome.as_deref(), query.dslabel.as_deref(), &image)?;

    let slide_path = resolved.key.resolve(state.catalog.mount_root());
    match tokio::fs::metadata(&slide_path).await {
        Ok(meta) if meta.is_file() => {}
        _ => {
            return Err(GatewayError::NotFound(format!(
                "no such image: {}",
                resolved.key
            )));
        }
    }

    let client_ref = query
        .client_ref
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let overlays = FsOverlayProvider::for_dataset(state.catalog.mount_root(), &resolved.dataset);
    let session = state
        .sessions
        .ensure_session(&resolved.key, &client_ref, &overlays)
        .await?;

    debug!(
        "Viewer {} holds {} on shard {}",
        client_ref, session.image_key, session.shard_id
    );

    Ok(Json(WsImagesResponse {
        status: "ok".to_string(),
        wsi_session_id: session.remote_session_token,
        image_key: session.image_key.to_string(),
        client_ref,
        overlays: session.overlays,
        slide_dimensions: [
            session.slide_dimensions.width(),
            session.slide_dimensions.height(),
        ],
    }))
}

/// DELETE /clearwsisession - Release viewer references
pub async fn clear_sessions(
    State(state): State<AppState>,
    Query(query): Query<ClearSessionsQuery>,
) -> Result<Json<ClearSessionsResponse>, GatewayError> {
    let pairs: Vec<(String, String)> = serde_json::from_str(&query.sessions)
        .map_err(|e| GatewayError::InvalidInput(format!("invalid sessions list: {}", e)))?;

    // Validate everything before releasing anything
    let pairs = pairs
        .into_iter()
        .map(|(key, client_ref)| Ok((ImageKey::parse(&key)?, client_ref)))
        .collect::<Result<Vec<_>, GatewayError>>()?;

    let mut released = 0;
    for (key, client_ref) in &pairs {
        match state.sessions.release_reference(key, client_ref).await? {
            ReleaseOutcome::NotHeld => {}
            ReleaseOutcome::Released | ReleaseOutcome::TornDown => released += 1,
        }
    }

    Ok(Json(ClearSessionsResponse {
        status: "ok".to_string(),
        released,
    }))
}

/// POST /resetwsisessions - Tear down every open session
pub async fn reset_sessions(
    State(state): State<AppState>,
) -> Result<Json<ResetSessionsResponse>, GatewayError> {
    let report = state.reset.reset_all().await?;
    counter!("wsigateway_bulk_resets_total").increment(1);
    info!(
        "Bulk reset requested: {} attempted, {} failed",
        report.attempted, report.failed
    );

    let status = if report.failed == 0 { "ok" } else { "partial" };
    Ok(Json(ResetSessionsResponse {
        status: status.to_string(),
        attempted: report.attempted,
        failed: report.failed,
    }))
}

/// Create router for the gateway API
pub fn gateway_routes(state: AppState) -> Router {
    Router::new()
        .route("/tile/:layer/:token/zoomify/:group/:file", get(get_tile))
        .route("/wsimages", get(open_wsimage).post(open_wsimage))
        .route("/clearwsisession", delete(clear_sessions))
        .route("/resetwsisessions", post(reset_sessions))
        .with_state(state)
}
