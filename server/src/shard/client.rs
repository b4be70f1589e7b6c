//! ShardClient trait definition

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use std::path::Path;

use super::types::{ColorMap, RemoteToken, Shard, ShardError, SlideDimensions, TileAddress};

/// Raw upstream tile response, relayed to the viewer unchanged
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Body,
}

/// Remote protocol spoken by every backend tile-rendering shard
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// `GET /session_id`: obtain a fresh session token
    async fn open_session(&self, shard: &Shard) -> Result<RemoteToken, ShardError>;

    /// `PUT /slide`: bind a slide file to the token
    async fn bind_slide(
        &self,
        shard: &Shard,
        token: &str,
        slide_path: &Path,
    ) -> Result<(), ShardError>;

    /// `PUT /overlay`: register one overlay file, returning its layer number
    async fn register_overlay(
        &self,
        shard: &Shard,
        token: &str,
        overlay_path: &Path,
    ) -> Result<u32, ShardError>;

    /// `PUT /cmap`: register the color map shared by overlay layers
    async fn register_color_map(
        &self,
        shard: &Shard,
        token: &str,
        color_map: &ColorMap,
    ) -> Result<(), ShardError>;

    /// `GET /slide`: slide dimensions for the bound slide.
    ///
    /// Doubles as the liveness probe: `ShardError::UnknownSession` means the
    /// shard has dropped the token.
    async fn slide_dimensions(
        &self,
        shard: &Shard,
        token: &str,
    ) -> Result<SlideDimensions, ShardError>;

    /// `PUT /reset/{token}`: tear the session down on the shard
    async fn reset(&self, shard: &Shard, token: &str) -> Result<(), ShardError>;

    /// Fetch one tile. Non-success upstream statuses are returned as a
    /// response, not as an error.
    async fn fetch_tile(
        &self,
        shard: &Shard,
        token: &str,
        tile: &TileAddress,
    ) -> Result<UpstreamResponse, ShardError>;
}
