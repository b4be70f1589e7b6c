//! Backend tile-rendering shards
//!
//! This module provides:
//! - `ShardDirectory` for deterministic image-key to shard routing
//! - `ShardClient` trait abstracting the remote tile-rendering protocol
//! - `HttpShardClient`, the `reqwest` implementation used in production

mod client;
mod directory;
mod http;
mod types;

pub use client::{ShardClient, UpstreamResponse};
pub use directory::ShardDirectory;
pub use http::HttpShardClient;
pub use types::{
    ColorMap, RemoteToken, Shard, ShardError, ShardId, SlideDimensions, TileAddress,
};
