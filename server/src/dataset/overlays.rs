//! Overlay discovery for a dataset
//!
//! Each overlay kind has its own folder. For a slide `<stem>.<ext>` the
//! provider looks, in order, for:
//! - `<folder>/<stem>.<ext>.<overlay_ext>`
//! - `<folder>/<stem>.<overlay_ext>`
//!
//! for every supported overlay extension.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::catalog::{DatasetConfig, OverlayFolders};
use crate::error::GatewayError;
use crate::session::{ImageKey, OverlayKind};
use crate::shard::ColorMap;

/// Overlay file extensions accepted by the tile shards (in order of preference)
const OVERLAY_EXTENSIONS: &[&str] = &["db", "tiff", "tif", "png", "geojson", "json", "dat"];

/// Overlay file to register with a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySource {
    pub kind: OverlayKind,
    pub path: PathBuf,
}

/// Source of the overlay files registered when a session is created
#[async_trait]
pub trait DatasetOverlayProvider: Send + Sync {
    /// Overlay files for an image, in registration order
    async fn overlay_sources(&self, key: &ImageKey) -> Result<Vec<OverlaySource>, GatewayError>;

    /// Color map shared by the overlay layers, if the dataset defines one
    fn color_map(&self) -> Option<ColorMap> {
        None
    }
}

/// Provider for images without overlays
pub struct NoOverlays;

#[async_trait]
impl DatasetOverlayProvider for NoOverlays {
    async fn overlay_sources(&self, _key: &ImageKey) -> Result<Vec<OverlaySource>, GatewayError> {
        Ok(Vec::new())
    }
}

/// Finds overlay files on the shared mount
pub struct FsOverlayProvider {
    mount_root: PathBuf,
    folders: OverlayFolders,
    color_map: Option<ColorMap>,
}

impl FsOverlayProvider {
    pub fn new(mount_root: impl Into<PathBuf>, folders: OverlayFolders) -> Self {
        Self {
            mount_root: mount_root.into(),
            folders,
            color_map: None,
        }
    }

    pub fn for_dataset(mount_root: &Path, dataset: &DatasetConfig) -> Self {
        Self {
            mount_root: mount_root.to_path_buf(),
            folders: dataset.overlays.clone(),
            color_map: dataset.color_map.clone(),
        }
    }

    fn folder(&self, kind: OverlayKind) -> Option<&str> {
        match kind {
            OverlayKind::Prediction => self.folders.prediction.as_deref(),
            OverlayKind::Uncertainty => self.folders.uncertainty.as_deref(),
            OverlayKind::Annotation => self.folders.annotation.as_deref(),
        }
    }
}

/// Candidate overlay file names for a slide file name
fn candidate_names(file_name: &str) -> Vec<String> {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(file_name);

    let mut names = Vec::with_capacity(OVERLAY_EXTENSIONS.len() * 2);
    for base in [file_name, stem] {
        for ext in OVERLAY_EXTENSIONS {
            let name = format!("{}.{}", base, ext);
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl DatasetOverlayProvider for FsOverlayProvider {
    async fn overlay_sources(&self, key: &ImageKey) -> Result<Vec<OverlaySource>, GatewayError> {
        let names = candidate_names(key.file_name());
        let mut sources = Vec::new();

        for kind in OverlayKind::ALL {
            let Some(folder) = self.folder(kind) else {
                continue;
            };
            // Folders come from configuration but are held to the same rules as keys
            let dir = ImageKey::parse(folder)
                .map_err(|e| {
                    GatewayError::Configuration(format!(
                        "invalid {} overlay folder '{}': {}",
                        kind.as_str(),
                        folder,
                        e
                    ))
                })?
                .resolve(&self.mount_root);

            for name in &names {
                let path = dir.join(name);
                if is_file(&path).await {
                    debug!("Found {} overlay for {} at {:?}", kind.as_str(), key, path);
                    sources.push(OverlaySource { kind, path });
                    break;
                }
            }
        }

        Ok(sources)
    }

    fn color_map(&self) -> Option<ColorMap> {
        self.color_map.clone()
    }
}
