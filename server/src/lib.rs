//! WSI Gateway Library
//!
//! Session-affine gateway in front of a pool of whole-slide-image tile
//! servers. Exported for the binary and the integration tests.

pub mod config;
pub mod dataset;
pub mod error;
pub mod proxy;
pub mod reset;
pub mod server;
pub mod session;
pub mod shard;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::Config;
pub use dataset::{DatasetCatalog, DatasetConfig, ImageRef};
pub use error::GatewayError;
pub use proxy::TileProxy;
pub use reset::{BulkResetCoordinator, ResetReport};
pub use server::{AppState, build_router};
pub use session::{ImageKey, InMemorySessionStore, Session, SessionManager, SessionStore};
pub use shard::{HttpShardClient, Shard, ShardClient, ShardDirectory};
