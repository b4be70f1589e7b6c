//! Canonical image keys

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::GatewayError;

/// Normalized, root-relative path of one whole-slide image file.
///
/// Serves as both the sharding key and the session key. A key can never
/// name anything outside the mount root it is resolved against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageKey(String);

impl ImageKey {
    /// Validate and normalize a relative image path.
    ///
    /// `.` and empty segments are dropped, both `/` and `\` separate
    /// segments, and `..`, absolute paths and drive prefixes are rejected.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        if raw.contains('\0') {
            return Err(GatewayError::InvalidInput(
                "image path contains a NUL byte".to_string(),
            ));
        }
        if raw.starts_with('/') || raw.starts_with('\\') {
            return Err(GatewayError::InvalidInput(format!(
                "image path must be relative: {}",
                raw
            )));
        }

        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(GatewayError::InvalidInput(format!(
                        "image path escapes the image root: {}",
                        raw
                    )));
                }
                s if s.contains(':') => {
                    return Err(GatewayError::InvalidInput(format!(
                        "invalid image path segment: {}",
                        s
                    )));
                }
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(GatewayError::InvalidInput("empty image path".to_string()));
        }
        Ok(Self(segments.join("/")))
    }

    /// Build a key from addressing components that must each be one segment
    /// (a folder from configuration may span several).
    pub fn from_segments(folder: &str, parts: &[&str]) -> Result<Self, GatewayError> {
        let mut joined = folder.trim_end_matches('/').to_string();
        for part in parts {
            let valid = !part.is_empty()
                && *part != "."
                && *part != ".."
                && !part.contains(['/', '\\', '\0', ':']);
            if !valid {
                return Err(GatewayError::InvalidInput(format!(
                    "invalid image path component: {}",
                    part
                )));
            }
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(part);
        }
        Self::parse(&joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute path of the image under `root`
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// File name of the image, e.g. `slideA.svs`
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageKey {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageKey> for String {
    fn from(key: ImageKey) -> Self {
        key.0
    }
}
