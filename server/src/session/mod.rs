//! Shared WSI sessions
//!
//! A session is one open slide on one shard, shared by every viewer of the
//! image and reference counted by viewer id. Records live in a
//! `SessionStore` reachable from every gateway instance.

mod key;
pub mod manager;
#[cfg(feature = "redis-store")]
mod redis_store;
mod state;
mod store;

pub use key::ImageKey;
pub use manager::{ReleaseOutcome, SessionManager, SessionManagerConfig};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisSessionStore;
pub use state::{ClientRefId, Overlay, OverlayKind, Session, now_millis};
pub use store::{InMemorySessionStore, Mutation, Mutator, SessionStore, StoreError, UpdateOutcome};
