//! Test Utilities Module
//!
//! Fakes for the shard protocol and overlay discovery, shared by the unit
//! tests of the session, proxy and reset modules.

#![cfg(test)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::dataset::{DatasetOverlayProvider, OverlaySource};
use crate::error::GatewayError;
use crate::session::ImageKey;
use crate::shard::{
    ColorMap, RemoteToken, Shard, ShardClient, ShardDirectory, ShardError, ShardId,
    SlideDimensions, TileAddress, UpstreamResponse,
};

/// Directory with `n` shards named `shard-0..`
pub fn test_shards(n: usize) -> Arc<ShardDirectory> {
    let shards = (0..n)
        .map(|i| Shard::new(format!("shard-{}", i), format!("http://tiles-{}:5000", i)))
        .collect();
    Arc::new(ShardDirectory::new(shards).expect("valid test shards"))
}

/// In-memory stand-in for a pool of tile shards that records every call
pub struct FakeShardClient {
    next_token: AtomicU64,
    next_layer: AtomicU32,
    handshakes: AtomicUsize,
    probes: AtomicUsize,
    overlay_registrations: AtomicUsize,
    color_maps: AtomicUsize,
    live: Mutex<HashSet<RemoteToken>>,
    bound: Mutex<Vec<(RemoteToken, PathBuf)>>,
    resets: Mutex<Vec<(ShardId, RemoteToken)>>,
    failing_resets: Mutex<HashSet<RemoteToken>>,
    tiles: Mutex<Vec<(RemoteToken, String)>>,
    tile_reply: Mutex<(StatusCode, &'static str, Vec<u8>)>,
    fail_bind: AtomicBool,
    handshake_delay: Duration,
}

impl FakeShardClient {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            next_layer: AtomicU32::new(1),
            handshakes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            overlay_registrations: AtomicUsize::new(0),
            color_maps: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            bound: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            failing_resets: Mutex::new(HashSet::new()),
            tiles: Mutex::new(Vec::new()),
            tile_reply: Mutex::new((StatusCode::OK, "image/jpeg", b"\xFF\xD8jpeg".to_vec())),
            fail_bind: AtomicBool::new(false),
            handshake_delay: Duration::ZERO,
        }
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub fn failing_bind(self) -> Self {
        self.fail_bind.store(true, Ordering::SeqCst);
        self
    }

    /// Make the shard drop a token, as after a shard restart
    pub fn forget_token(&self, token: &str) {
        self.live.lock().unwrap().remove(token);
    }

    /// Make resets of `token` fail with a 500
    pub fn fail_reset_of(&self, token: &str) {
        self.failing_resets.lock().unwrap().insert(token.to_string());
    }

    pub fn set_tile_reply(&self, status: StatusCode, content_type: &'static str, body: &[u8]) {
        *self.tile_reply.lock().unwrap() = (status, content_type, body.to_vec());
    }

    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn overlay_registrations(&self) -> usize {
        self.overlay_registrations.load(Ordering::SeqCst)
    }

    pub fn color_maps(&self) -> usize {
        self.color_maps.load(Ordering::SeqCst)
    }

    pub fn bound_slides(&self) -> Vec<(RemoteToken, PathBuf)> {
        self.bound.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<(ShardId, RemoteToken)> {
        self.resets.lock().unwrap().clone()
    }

    /// `(token, shard path)` of every tile fetched
    pub fn tiles(&self) -> Vec<(RemoteToken, String)> {
        self.tiles.lock().unwrap().clone()
    }

    fn require_live(&self, token: &str) -> Result<(), ShardError> {
        if self.live.lock().unwrap().contains(token) {
            Ok(())
        } else {
            Err(ShardError::UnknownSession)
        }
    }
}

#[async_trait]
impl ShardClient for FakeShardClient {
    async fn open_session(&self, shard: &Shard) -> Result<RemoteToken, ShardError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let token = format!("{}-tok-{}", shard.id, n);
        self.live.lock().unwrap().insert(token.clone());
        Ok(token)
    }

    async fn bind_slide(
        &self,
        _shard: &Shard,
        token: &str,
        slide_path: &Path,
    ) -> Result<(), ShardError> {
        self.require_live(token)?;
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(ShardError::Status {
                status: 500,
                body: "cannot open slide".to_string(),
            });
        }
        self.bound
            .lock()
            .unwrap()
            .push((token.to_string(), slide_path.to_path_buf()));
        Ok(())
    }

    async fn register_overlay(
        &self,
        _shard: &Shard,
        token: &str,
        _overlay_path: &Path,
    ) -> Result<u32, ShardError> {
        self.require_live(token)?;
        self.overlay_registrations.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_layer.fetch_add(1, Ordering::SeqCst))
    }

    async fn register_color_map(
        &self,
        _shard: &Shard,
        token: &str,
        _color_map: &ColorMap,
    ) -> Result<(), ShardError> {
        self.require_live(token)?;
        self.color_maps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn slide_dimensions(
        &self,
        _shard: &Shard,
        token: &str,
    ) -> Result<SlideDimensions, ShardError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.require_live(token)?;
        Ok(SlideDimensions(40000, 30000))
    }

    async fn reset(&self, shard: &Shard, token: &str) -> Result<(), ShardError> {
        self.resets
            .lock()
            .unwrap()
            .push((shard.id.clone(), token.to_string()));
        if self.failing_resets.lock().unwrap().contains(token) {
            return Err(ShardError::Status {
                status: 500,
                body: "reset failed".to_string(),
            });
        }
        self.live.lock().unwrap().remove(token);
        Ok(())
    }

    async fn fetch_tile(
        &self,
        _shard: &Shard,
        token: &str,
        tile: &TileAddress,
    ) -> Result<UpstreamResponse, ShardError> {
        self.tiles
            .lock()
            .unwrap()
            .push((token.to_string(), tile.path(token)));
        let (status, content_type, body) = self.tile_reply.lock().unwrap().clone();
        Ok(UpstreamResponse {
            status,
            content_type: Some(content_type.to_string()),
            body: Body::from(body),
        })
    }
}

/// Overlay provider returning a fixed list
pub struct StaticOverlays {
    sources: Vec<OverlaySource>,
    color_map: Option<ColorMap>,
}

impl StaticOverlays {
    pub fn new(sources: Vec<OverlaySource>) -> Self {
        Self {
            sources,
            color_map: None,
        }
    }

    pub fn with_color_map(mut self, color_map: ColorMap) -> Self {
        self.color_map = Some(color_map);
        self
    }
}

#[async_trait]
impl DatasetOverlayProvider for StaticOverlays {
    async fn overlay_sources(&self, _key: &ImageKey) -> Result<Vec<OverlaySource>, GatewayError> {
        Ok(self.sources.clone())
    }

    fn color_map(&self) -> Option<ColorMap> {
        self.color_map.clone()
    }
}
