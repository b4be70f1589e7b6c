//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tower::util::ServiceExt;
use wsi_gateway::session::SessionManagerConfig;
use wsi_gateway::shard::{
    ColorMap, RemoteToken, ShardError, ShardId, SlideDimensions, TileAddress, UpstreamResponse,
};
use wsi_gateway::{
    AppState, DatasetCatalog, DatasetConfig, InMemorySessionStore, SessionManager, Shard,
    ShardClient, ShardDirectory, build_router,
};

/// Shard client that keeps every session alive and records what it was asked
pub struct RecordingShardClient {
    next_token: AtomicU64,
    handshakes: AtomicUsize,
    resets: Mutex<Vec<(ShardId, RemoteToken)>>,
    tile_reply: Mutex<(StatusCode, Vec<u8>)>,
}

impl RecordingShardClient {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            handshakes: AtomicUsize::new(0),
            resets: Mutex::new(Vec::new()),
            tile_reply: Mutex::new((StatusCode::OK, b"\xFF\xD8tile".to_vec())),
        }
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> Vec<(ShardId, RemoteToken)> {
        self.resets.lock().unwrap().clone()
    }

    pub fn set_tile_reply(&self, status: StatusCode, body: &[u8]) {
        *self.tile_reply.lock().unwrap() = (status, body.to_vec());
    }
}

#[async_trait]
impl ShardClient for RecordingShardClient {
    async fn open_session(&self, shard: &Shard) -> Result<RemoteToken, ShardError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-{}", shard.id, n))
    }

    async fn bind_slide(&self, _: &Shard, _: &str, _: &Path) -> Result<(), ShardError> {
        Ok(())
    }

    async fn register_overlay(&self, _: &Shard, _: &str, _: &Path) -> Result<u32, ShardError> {
        Ok(1)
    }

    async fn register_color_map(
        &self,
        _: &Shard,
        _: &str,
        _: &ColorMap,
    ) -> Result<(), ShardError> {
        Ok(())
    }

    async fn slide_dimensions(&self, _: &Shard, _: &str) -> Result<SlideDimensions, ShardError> {
        Ok(SlideDimensions(2048, 1536))
    }

    async fn reset(&self, shard: &Shard, token: &str) -> Result<(), ShardError> {
        self.resets
            .lock()
            .unwrap()
            .push((shard.id.clone(), token.to_string()));
        Ok(())
    }

    async fn fetch_tile(
        &self,
        _: &Shard,
        _: &str,
        _: &TileAddress,
    ) -> Result<UpstreamResponse, ShardError> {
        let (status, body) = self.tile_reply.lock().unwrap().clone();
        let content_type = if status.is_success() {
            "image/jpeg"
        } else {
            "text/plain"
        };
        Ok(UpstreamResponse {
            status,
            content_type: Some(content_type.to_string()),
            body: Body::from(body),
        })
    }
}

/// Fresh mount root holding `wsi/S01/slide.svs` and `wsi/S02/other.svs`
pub fn create_mount_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("wsigateway-test-{}", uuid::Uuid::new_v4()));
    for (sample, file) in [("S01", "slide.svs"), ("S02", "other.svs")] {
        let dir = root.join("wsi").join(sample);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), b"not really a slide").unwrap();
    }
    root
}

/// The single test dataset, `hg38` / `TCGA`, with images under `wsi/`
pub fn test_datasets() -> Vec<DatasetConfig> {
    serde_json::from_str(r#"[{"genome": "hg38", "dslabel": "TCGA", "image_folder": "wsi"}]"#)
        .unwrap()
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub mount_root: PathBuf,
}

/// Create a test application over `client` and a two-shard pool
pub fn create_test_app_with_client(client: Arc<dyn ShardClient>, shards: Vec<Shard>) -> TestApp {
    let mount_root = create_mount_root();
    let directory = Arc::new(ShardDirectory::new(shards).unwrap());
    // Probe on every access so shard restarts are noticed immediately
    let sessions = Arc::new(SessionManager::with_config(
        directory,
        Arc::new(InMemorySessionStore::new()),
        client,
        mount_root.clone(),
        SessionManagerConfig {
            liveness_grace: Duration::ZERO,
        },
    ));
    let catalog = Arc::new(DatasetCatalog::new(mount_root.clone(), test_datasets()));
    let state = AppState::new(sessions, catalog);

    TestApp {
        router: build_router(state.clone()),
        state,
        mount_root,
    }
}

/// Create a test application backed by a recording shard client
pub fn create_test_app() -> (TestApp, Arc<RecordingShardClient>) {
    let client = Arc::new(RecordingShardClient::new());
    let shards = vec![
        Shard::new("a", "http://tiles-a:5000"),
        Shard::new("b", "http://tiles-b:5000"),
    ];
    (create_test_app_with_client(client.clone(), shards), client)
}

/// Percent-encode a query parameter value
pub fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

pub fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Send one request and return the status and raw body
pub async fn send_raw(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

/// Send one request and parse the JSON body
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, body) = send_raw(router, request).await;
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// `/wsimages` query for a sample image of the test dataset
pub fn wsimages_uri(sample: &str, wsimage: &str, client_ref: Option<&str>) -> String {
    let mut uri = format!(
        "/wsimages?genome=hg38&dslabel=TCGA&sampleId={}&wsimage={}",
        encode(sample),
        encode(wsimage)
    );
    if let Some(client_ref) = client_ref {
        uri.push_str(&format!("&client_ref={}", encode(client_ref)));
    }
    uri
}

/// Tile URI for a sample image of the test dataset
pub fn tile_uri(token: &str, sample: &str, wsimage: &str, client_ref: Option<&str>) -> String {
    let mut uri = format!(
        "/tile/slide/{}/zoomify/TileGroup0/2-1-0@1x.jpg?genome=hg38&dslabel=TCGA&sample_id={}&wsi_image={}",
        token,
        encode(sample),
        encode(wsimage)
    );
    if let Some(client_ref) = client_ref {
        uri.push_str(&format!("&client_ref={}", encode(client_ref)));
    }
    uri
}
