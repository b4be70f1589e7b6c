//! Dataset catalog
//!
//! Maps the portal's `(genome, dslabel, sample | AI project, file)` addressing
//! to image keys, and finds the overlay files registered with each session.

mod catalog;
mod overlays;

pub use catalog::{DatasetCatalog, DatasetConfig, ImageRef, OverlayFolders, ResolvedImage};
pub use overlays::{DatasetOverlayProvider, FsOverlayProvider, NoOverlays, OverlaySource};
