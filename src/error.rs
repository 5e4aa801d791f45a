//! Error types for the squash pipeline.
//!
//! Most functions in this crate return [`anyhow::Result`] and attach the step that failed as
//! context.  The conditions a caller may want to tell apart are represented by [`Error`] and can
//! be recovered with [`anyhow::Error::downcast_ref`].
//!
//! # Error Categories
//!
//! - **Input shape**: [`ManifestShape`], [`InspectCount`], [`NoLayers`], [`LayerMismatch`]
//! - **Derivation**: [`NotDerived`], [`IdenticalToBase`]
//! - **External processes**: [`CommandFailed`]
//! - **Engine misuse**: [`LayerOrder`]
//!
//! [`ManifestShape`]: Error::ManifestShape
//! [`InspectCount`]: Error::InspectCount
//! [`NoLayers`]: Error::NoLayers
//! [`LayerMismatch`]: Error::LayerMismatch
//! [`NotDerived`]: Error::NotDerived
//! [`IdenticalToBase`]: Error::IdenticalToBase
//! [`CommandFailed`]: Error::CommandFailed
//! [`LayerOrder`]: Error::LayerOrder

use std::{path::PathBuf, process::ExitStatus};

/// Distinguishable failures of the squash pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The saved image manifest doesn't describe exactly one image.
    #[error("{} has unexpected format: expected 1 image, found {count}", path.display())]
    ManifestShape { path: PathBuf, count: usize },

    /// Image inspection returned metadata for the wrong number of images.
    #[error("image inspection returned {found} images, want {expected}")]
    InspectCount { expected: usize, found: usize },

    /// Image inspection reported an image without layers.
    #[error("image {image} has no layers")]
    NoLayers { image: String },

    /// The inspected layer list doesn't line up with the layer archives of the saved image.
    #[error("image {image}: {reason}")]
    LayerMismatch { image: String, reason: String },

    /// The image shares no leading layers with the requested base image.
    #[error("image {image} is not derived from image {base}")]
    NotDerived { image: String, base: String },

    /// The image has no layers beyond those of the requested base image.
    #[error("image {image} is the same as {base}")]
    IdenticalToBase { image: String, base: String },

    /// An external program exited unsuccessfully.
    #[error("{command} failed: {status}")]
    CommandFailed { command: String, status: ExitStatus },

    /// Layers were handed to the squash engine in something other than newest-first order.
    #[error("layer {next} added after layer {previous}: layers must be squashed newest first")]
    LayerOrder { previous: usize, next: usize },
}
