//! Per-request tile forwarding

use axum::http::{HeaderValue, header};
use axum::response::Response;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::dataset::{DatasetCatalog, FsOverlayProvider, ImageRef};
use crate::error::GatewayError;
use crate::session::{ClientRefId, SessionManager};
use crate::shard::{TileAddress, UpstreamResponse};

/// A viewer's tile request after path and query parsing
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub genome: Option<String>,
    pub dslabel: Option<String>,
    pub image: ImageRef,
    /// Viewer holding the image open; without one the image must already be open
    pub client_ref: Option<ClientRefId>,
    /// Token the viewer addressed; informational only, routing uses the stored one
    pub viewer_token: String,
    pub tile: TileAddress,
}

/// Resolves tile requests to a session and relays the shard's reply verbatim
pub struct TileProxy {
    sessions: Arc<SessionManager>,
    catalog: Arc<DatasetCatalog>,
}

impl TileProxy {
    pub fn new(sessions: Arc<SessionManager>, catalog: Arc<DatasetCatalog>) -> Self {
        Self { sessions, catalog }
    }

    pub async fn proxy(&self, request: &TileRequest) -> Result<Response, GatewayError> {
        let start = Instant::now();
        let resolved = self.catalog.resolve(
            request.genome.as_deref(),
            request.dslabel.as_deref(),
            &request.image,
        )?;

        let session = match request.client_ref {
            Some(ref client_ref) => {
                let overlays =
                    FsOverlayProvider::for_dataset(self.catalog.mount_root(), &resolved.dataset);
                self.sessions
                    .ensure_session(&resolved.key, client_ref, &overlays)
                    .await?
            }
            None => self.sessions.existing_session(&resolved.key).await?,
        };
        if session.remote_session_token != request.viewer_token {
            debug!(
                "Viewer addressed stale token for {}; using current session",
                resolved.key
            );
        }

        let shard = self.sessions.shard_for(&session)?;
        let (upstream, touched) = tokio::join!(
            self.sessions.client().fetch_tile(
                shard,
                &session.remote_session_token,
                &request.tile
            ),
            self.sessions.touch(&resolved.key),
        );
        if let Err(e) = touched {
            warn!("Failed to record tile activity for {}: {}", resolved.key, e);
        }

        let upstream = upstream.map_err(|e| GatewayError::upstream(&shard.id, e))?;
        let status = upstream.status.as_u16().to_string();
        counter!("wsigateway_tile_requests_total", "status" => status).increment(1);
        histogram!("wsigateway_tile_duration_seconds").record(start.elapsed());
        Ok(relay(upstream))
    }
}

/// Pass status, content type and body through unchanged
pub fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(upstream.body);
    *response.status_mut() = upstream.status;
    if let Some(content_type) = upstream.content_type
        && let Ok(value) = HeaderValue::from_str(&content_type)
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

/// Parse the zoomify tile segments of `/tile/{layer}/{token}/zoomify/{group}/{z}-{x}-{y}@1x.jpg`
pub fn parse_tile_address(
    layer: &str,
    tile_group: &str,
    file: &str,
) -> Result<TileAddress, GatewayError> {
    let valid_layer = !layer.is_empty()
        && layer
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_layer {
        return Err(GatewayError::InvalidInput(format!(
            "invalid tile layer: {}",
            layer
        )));
    }

    let group_ok = tile_group
        .strip_prefix("TileGroup")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    if !group_ok {
        return Err(GatewayError::InvalidInput(format!(
            "invalid tile group: {}",
            tile_group
        )));
    }

    let coords = file
        .strip_suffix("@1x.jpg")
        .ok_or_else(|| GatewayError::InvalidInput(format!("invalid tile name: {}", file)))?;
    let parsed: Vec<u32> = coords
        .split('-')
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| GatewayError::InvalidInput(format!("invalid tile coordinates: {}", file)))?;
    let [z, x, y] = parsed[..] else {
        return Err(GatewayError::InvalidInput(format!(
            "invalid tile coordinates: {}",
            file
        )));
    };

    Ok(TileAddress {
        layer: layer.to_string(),
        tile_group: tile_group.to_string(),
        z,
        x,
        y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetConfig;
    use crate::session::{ImageKey, InMemorySessionStore, SessionStore};
    use crate::test_utils::{FakeShardClient, test_shards};
    use axum::http::StatusCode;

    struct Harness {
        proxy: TileProxy,
        sessions: Arc<SessionManager>,
        store: Arc<InMemorySessionStore>,
        client: Arc<FakeShardClient>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemorySessionStore::new());
        let client = Arc::new(FakeShardClient::new());
        let sessions = Arc::new(SessionManager::new(
            test_shards(2),
            store.clone(),
            client.clone(),
            "/mnt/wsi",
        ));
        let datasets: Vec<DatasetConfig> = serde_json::from_str(
            r#"[{"genome": "hg38", "dslabel": "TCGA", "image_folder": "wsi/tcga"}]"#,
        )
        .unwrap();
        let catalog = Arc::new(DatasetCatalog::new("/mnt/wsi", datasets));
        Harness {
            proxy: TileProxy::new(sessions.clone(), catalog),
            sessions,
            store,
            client,
        }
    }

    fn request(wsimage: &str, client_ref: Option<&str>) -> TileRequest {
        TileRequest {
            genome: Some("hg38".to_string()),
            dslabel: Some("TCGA".to_string()),
            image: ImageRef::Sample {
                sample_id: "S01".to_string(),
                wsimage: wsimage.to_string(),
            },
            client_ref: client_ref.map(str::to_string),
            viewer_token: "viewer-token".to_string(),
            tile: parse_tile_address("slide", "TileGroup0", "3-1-2@1x.jpg").unwrap(),
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_parse_tile_address() {
        let tile = parse_tile_address("overlay_1", "TileGroup12", "5-10-7@1x.jpg").unwrap();
        assert_eq!(tile.z, 5);
        assert_eq!(tile.x, 10);
        assert_eq!(tile.y, 7);
        assert_eq!(
            tile.path("tok"),
            "/tile/overlay_1/tok/zoomify/TileGroup12/5-10-7@1x.jpg"
        );
    }

    #[test]
    fn test_parse_tile_address_rejects_garbage() {
        assert!(parse_tile_address("../x", "TileGroup0", "1-1-1@1x.jpg").is_err());
        assert!(parse_tile_address("slide", "Group0", "1-1-1@1x.jpg").is_err());
        assert!(parse_tile_address("slide", "TileGroup", "1-1-1@1x.jpg").is_err());
        assert!(parse_tile_address("slide", "TileGroup0", "1-1-1.jpg").is_err());
        assert!(parse_tile_address("slide", "TileGroup0", "1-1@1x.jpg").is_err());
        assert!(parse_tile_address("slide", "TileGroup0", "1-1-1-1@1x.jpg").is_err());
        assert!(parse_tile_address("slide", "TileGroup0", "a-1-1@1x.jpg").is_err());
    }

    #[tokio::test]
    async fn test_tile_forwarded_with_session_token() {
        let h = harness();
        let response = h.proxy.proxy(&request("slideA.svs", Some("A"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        assert_eq!(body_bytes(response).await, b"\xFF\xD8jpeg".to_vec());

        let key = ImageKey::parse("wsi/tcga/S01/slideA.svs").unwrap();
        let session = h.store.get(&key).await.unwrap().unwrap();
        let tiles = h.client.tiles();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].0, session.remote_session_token);
        assert!(tiles[0].1.ends_with("/zoomify/TileGroup0/3-1-2@1x.jpg"));
    }

    #[tokio::test]
    async fn test_upstream_error_passed_through_verbatim() {
        let h = harness();
        h.client
            .set_tile_reply(StatusCode::NOT_FOUND, "text/plain", b"tile not found");

        let response = h.proxy.proxy(&request("slideA.svs", Some("A"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"tile not found".to_vec());
    }

    #[tokio::test]
    async fn test_tile_without_client_ref_requires_open_session() {
        let h = harness();

        let result = h.proxy.proxy(&request("slideA.svs", None)).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(h.client.handshakes(), 0);

        h.proxy.proxy(&request("slideA.svs", Some("A"))).await.unwrap();
        let response = h.proxy.proxy(&request("slideA.svs", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.client.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_tile_activity_refreshes_last_access() {
        let h = harness();
        let key = ImageKey::parse("wsi/tcga/S01/slideA.svs").unwrap();
        h.proxy.proxy(&request("slideA.svs", Some("A"))).await.unwrap();
        let before = h.sessions.existing_session(&key).await.unwrap().last_access;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        h.proxy.proxy(&request("slideA.svs", None)).await.unwrap();

        let after = h.sessions.existing_session(&key).await.unwrap().last_access;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_any_remote_call() {
        let h = harness();

        let result = h.proxy.proxy(&request("../../etc/passwd", Some("A"))).await;

        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
        assert_eq!(h.client.handshakes(), 0);
        assert!(h.client.tiles().is_empty());
        assert!(h.store.list_all().await.unwrap().is_empty());
    }
}
