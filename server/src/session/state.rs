use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use super::key::ImageKey;
use crate::shard::{RemoteToken, ShardId, SlideDimensions};

/// Opaque id of one logical viewer holding an image open
pub type ClientRefId = String;

/// Kind of auxiliary layer composited over the slide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Prediction,
    Uncertainty,
    Annotation,
}

impl OverlayKind {
    /// Registration order during session creation
    pub const ALL: [OverlayKind; 3] = [
        OverlayKind::Prediction,
        OverlayKind::Uncertainty,
        OverlayKind::Annotation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayKind::Prediction => "prediction",
            OverlayKind::Uncertainty => "uncertainty",
            OverlayKind::Annotation => "annotation",
        }
    }
}

/// Overlay layer registered with the shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub layer_number: u32,
    pub kind: OverlayKind,
}

/// One open slide on one shard, shared by every viewer of the image.
///
/// Overlays are fixed when the session is created; a session never
/// persists with an empty `client_refs` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub image_key: ImageKey,
    pub remote_session_token: RemoteToken,
    pub shard_id: ShardId,
    pub overlays: Vec<Overlay>,
    pub client_refs: BTreeSet<ClientRefId>,
    pub slide_dimensions: SlideDimensions,
    pub created_at: u64,
    /// Last tile or session activity (ms since epoch)
    pub last_access: u64,
    /// Last time the shard confirmed the token (ms since epoch)
    pub verified_at: u64,
}

impl Session {
    /// Add a viewer reference; returns false when it was already present
    pub fn add_ref(&mut self, client_ref: &str) -> bool {
        self.client_refs.insert(client_ref.to_string())
    }

    /// Remove a viewer reference; returns false when it was not a member
    pub fn remove_ref(&mut self, client_ref: &str) -> bool {
        self.client_refs.remove(client_ref)
    }

    pub fn has_refs(&self) -> bool {
        !self.client_refs.is_empty()
    }

    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access)
    }
}

/// Get current timestamp in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
