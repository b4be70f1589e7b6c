//! Server configuration
//!
//! Configuration is loaded from environment variables. Dataset definitions
//! are read from the JSON file named by `DATASETS_FILE`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::dataset::DatasetConfig;
use crate::error::GatewayError;
use crate::shard::Shard;

/// Main server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,

    /// Backend tile-rendering shard pool
    pub shards: Vec<Shard>,

    /// Mount root that every image key is resolved against
    pub mount_root: Option<PathBuf>,

    /// Path to the JSON dataset definitions
    pub datasets_file: Option<PathBuf>,

    /// Session configuration
    pub session: SessionConfig,

    /// Per-call timeouts towards the shards
    pub timeouts: ShardTimeouts,
}

/// Session-related configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `memory` or a `redis://` URL
    pub store_url: String,
    /// Sliding TTL applied by the store layer
    pub ttl: Duration,
    /// Sessions idle for longer than this are torn down by the janitor
    pub idle_timeout: Duration,
    /// Skip the liveness probe when the session was verified this recently
    pub liveness_grace: Duration,
}

/// Timeouts for each kind of remote shard call
#[derive(Debug, Clone, Copy)]
pub struct ShardTimeouts {
    /// Handshake, slide bind, overlay and color map registration
    pub setup: Duration,
    /// Tile fetch
    pub tile: Duration,
    /// Session reset
    pub reset: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shards: Vec::new(),
            mount_root: None,
            datasets_file: None,
            session: SessionConfig::default(),
            timeouts: ShardTimeouts::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_url: "memory".to_string(),
            ttl: Duration::from_secs(4 * 60 * 60), // 4 hours
            idle_timeout: Duration::from_secs(60 * 60),
            liveness_grace: Duration::from_secs(10),
        }
    }
}

impl Default for ShardTimeouts {
    fn default() -> Self {
        Self {
            setup: Duration::from_secs(60),
            tile: Duration::from_secs(120),
            reset: Duration::from_secs(50),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server config
        if let Ok(host) = env::var("HOST") {
            config.host = host;
        }
        if let Ok(port) = env::var("PORT")
            && let Ok(p) = port.parse()
        {
            config.port = p;
        }

        // Shard pool and data locations
        if let Ok(urls) = env::var("SHARD_URLS") {
            config.shards = parse_shard_urls(&urls);
        }
        if let Ok(root) = env::var("WSI_MOUNT_ROOT")
            && !root.is_empty()
        {
            config.mount_root = Some(PathBuf::from(root));
        }
        if let Ok(path) = env::var("DATASETS_FILE")
            && !path.is_empty()
        {
            config.datasets_file = Some(PathBuf::from(path));
        }

        // Session config
        if let Ok(url) = env::var("SESSION_STORE_URL")
            && !url.is_empty()
        {
            config.session.store_url = url;
        }
        if let Some(d) = env_secs("SESSION_TTL_SECS") {
            config.session.ttl = d;
        }
        if let Some(d) = env_secs("SESSION_IDLE_TIMEOUT_SECS") {
            config.session.idle_timeout = d;
        }
        if let Some(d) = env_secs("LIVENESS_GRACE_SECS") {
            config.session.liveness_grace = d;
        }

        // Shard timeouts
        if let Some(d) = env_secs("SHARD_SETUP_TIMEOUT_SECS") {
            config.timeouts.setup = d;
        }
        if let Some(d) = env_secs("SHARD_TILE_TIMEOUT_SECS") {
            config.timeouts.tile = d;
        }
        if let Some(d) = env_secs("SHARD_RESET_TIMEOUT_SECS") {
            config.timeouts.reset = d;
        }

        config
    }

    /// Fail fast on settings the gateway cannot run without
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.shards.is_empty() {
            return Err(GatewayError::Configuration(
                "SHARD_URLS is empty; at least one tile shard is required".to_string(),
            ));
        }
        if self.mount_root.is_none() {
            return Err(GatewayError::Configuration(
                "WSI_MOUNT_ROOT is not set".to_string(),
            ));
        }
        // Records that expire in the store are never reset on their shard
        if self.session.ttl < self.session.idle_timeout {
            return Err(GatewayError::Configuration(format!(
                "SESSION_TTL_SECS ({}) must not be shorter than SESSION_IDLE_TIMEOUT_SECS ({})",
                self.session.ttl.as_secs(),
                self.session.idle_timeout.as_secs()
            )));
        }
        Ok(())
    }

    /// Read dataset definitions, or none when no file is configured
    pub fn load_datasets(&self) -> Result<Vec<DatasetConfig>, GatewayError> {
        let Some(ref path) = self.datasets_file else {
            return Ok(Vec::new());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("failed to read {:?}: {}", path, e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Configuration(format!("invalid dataset file {:?}: {}", path, e))
        })
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse `SHARD_URLS`: comma separated `id=url` or bare `url` entries
pub fn parse_shard_urls(raw: &str) -> Vec<Shard> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(idx, entry)| match entry.split_once('=') {
            Some((id, url)) if !id.contains("://") => Shard::new(id.trim(), url.trim()),
            _ => Shard::new(format!("shard-{}", idx), entry),
        })
        .collect()
}
