//! Shard-related types and error definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one backend tile-rendering service instance
pub type ShardId = String;

/// Opaque session token issued by a shard's `/session_id` endpoint
pub type RemoteToken = String;

/// One backend tile-rendering service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    /// Base URL without trailing slash, e.g. `http://tiles-0:5000`
    pub base_url: String,
}

impl Shard {
    pub fn new(id: impl Into<ShardId>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Absolute URL for a path on this shard (`path` starts with `/`)
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Full-resolution slide size as reported by the shard (`[width, height]` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideDimensions(pub u64, pub u64);

impl SlideDimensions {
    pub fn width(&self) -> u64 {
        self.0
    }

    pub fn height(&self) -> u64 {
        self.1
    }
}

/// Color map shared by all overlay layers of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMap {
    pub keys: Vec<String>,
    pub values: Vec<String>,
}

/// Zoomify tile address as understood by the shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileAddress {
    /// Layer type, e.g. `slide` or an overlay layer name
    pub layer: String,
    /// Zoomify tile group segment, e.g. `TileGroup0`
    pub tile_group: String,
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    /// Shard-side path for this tile under the given session token
    pub fn path(&self, token: &str) -> String {
        format!(
            "/tile/{}/{}/zoomify/{}/{}-{}-{}@1x.jpg",
            self.layer, token, self.tile_group, self.z, self.x, self.y
        )
    }
}

/// Errors from the remote tile-rendering protocol
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("shard returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("shard does not recognize session token")]
    UnknownSession,

    #[error("request to shard timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}
