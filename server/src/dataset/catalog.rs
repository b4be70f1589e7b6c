//! Dataset definitions and image addressing

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::session::ImageKey;
use crate::shard::ColorMap;

/// Per-kind overlay folders, relative to the mount root
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverlayFolders {
    #[serde(default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub uncertainty: Option<String>,
    #[serde(default)]
    pub annotation: Option<String>,
}

/// One dataset entry of `DATASETS_FILE`
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub genome: String,
    pub dslabel: String,
    /// Folder holding `<sample_id>/<wsimage>`; datasets without one serve no sample images
    #[serde(default)]
    pub image_folder: Option<String>,
    /// Folder holding `<project_id>/<wsimage>` for AI project images
    #[serde(default)]
    pub ai_project_folder: Option<String>,
    #[serde(default)]
    pub overlays: OverlayFolders,
    #[serde(default)]
    pub color_map: Option<ColorMap>,
}

/// How the portal addresses an image within a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Sample { sample_id: String, wsimage: String },
    AiProject { project_id: String, wsimage: String },
}

/// A request resolved to its image key and owning dataset
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub key: ImageKey,
    pub dataset: Arc<DatasetConfig>,
}

/// Lookup of datasets by `(genome, dslabel)`
#[derive(Debug, Clone)]
pub struct DatasetCatalog {
    mount_root: PathBuf,
    datasets: HashMap<(String, String), Arc<DatasetConfig>>,
}

impl DatasetCatalog {
    pub fn new(mount_root: impl Into<PathBuf>, datasets: Vec<DatasetConfig>) -> Self {
        let datasets = datasets
            .into_iter()
            .map(|d| ((d.genome.clone(), d.dslabel.clone()), Arc::new(d)))
            .collect();
        Self {
            mount_root: mount_root.into(),
            datasets,
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn dataset(&self, genome: &str, dslabel: &str) -> Option<Arc<DatasetConfig>> {
        self.datasets
            .get(&(genome.to_string(), dslabel.to_string()))
            .cloned()
    }

    /// Map addressing parameters to an image key. No I/O is performed.
    pub fn resolve(
        &self,
        genome: Option<&str>,
        dslabel: Option<&str>,
        image: &ImageRef,
    ) -> Result<ResolvedImage, GatewayError> {
        let genome = non_empty(genome)
            .ok_or_else(|| GatewayError::InvalidInput("missing genome".to_string()))?;
        let dslabel = non_empty(dslabel)
            .ok_or_else(|| GatewayError::InvalidInput("missing dslabel".to_string()))?;

        let dataset = self.dataset(genome, dslabel).ok_or_else(|| {
            GatewayError::NotFound(format!("unknown dataset {}/{}", genome, dslabel))
        })?;

        let key = match image {
            ImageRef::Sample { sample_id, wsimage } => {
                let folder = dataset.image_folder.as_deref().ok_or_else(|| {
                    GatewayError::NotFound(format!(
                        "dataset {} has no whole-slide images",
                        dslabel
                    ))
                })?;
                ImageKey::from_segments(folder, &[sample_id.as_str(), wsimage.as_str()])?
            }
            ImageRef::AiProject {
                project_id,
                wsimage,
            } => {
                let folder = dataset.ai_project_folder.as_deref().ok_or_else(|| {
                    GatewayError::NotFound(format!(
                        "dataset {} has no AI project images",
                        dslabel
                    ))
                })?;
                ImageKey::from_segments(folder, &[project_id.as_str(), wsimage.as_str()])?
            }
        };

        Ok(ResolvedImage { key, dataset })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
