//! Reading the directory produced by extracting a `docker save` archive.

use std::{
    fs::File,
    io::Read,
    ops::Range,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use oci_spec::image::ImageConfiguration;
use serde::Deserialize;

use crate::{error::Error, layer::Layer};

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// One image described by `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// The image configuration, relative to the save directory.
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    /// Layer archives relative to the save directory, oldest first.
    pub layers: Vec<String>,
}

/// An extracted `docker save` archive holding exactly one image.
#[derive(Debug)]
pub struct SavedImage {
    dir: PathBuf,
    manifest: ManifestEntry,
}

impl SavedImage {
    /// Opens a save directory and parses its manifest.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(MANIFEST_FILENAME);
        let file = File::open(&path).with_context(|| format!("Failed to open {path:?}"))?;
        let mut entries: Vec<ManifestEntry> = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse {path:?}"))?;

        if entries.len() != 1 {
            return Err(Error::ManifestShape {
                path,
                count: entries.len(),
            }
            .into());
        }
        let manifest = entries.remove(0);

        Ok(SavedImage { dir, manifest })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &ManifestEntry {
        &self.manifest
    }

    /// Layer archive names, oldest first.
    pub fn layers(&self) -> &[String] {
        &self.manifest.layers
    }

    pub fn layer_count(&self) -> usize {
        self.manifest.layers.len()
    }

    /// The ordinals of the `count` newest layers, ascending.  Asking for more layers than the
    /// image has selects all of them.
    pub fn newest(&self, count: usize) -> Range<usize> {
        let total = self.layer_count();
        total.saturating_sub(count)..total
    }

    /// The uncompressed layer identifiers from the image configuration, if the save has one.
    pub fn diff_ids(&self) -> Result<Option<Vec<String>>> {
        let Some(ref config) = self.manifest.config else {
            return Ok(None);
        };
        let path = self.dir.join(config);
        let config = ImageConfiguration::from_file(&path)
            .with_context(|| format!("Failed to read image configuration {path:?}"))?;
        Ok(Some(config.rootfs().diff_ids().clone()))
    }

    /// Size in bytes of a layer archive.
    pub fn layer_size(&self, index: usize) -> Result<u64> {
        let path = self.layer_path(index)?;
        let metadata =
            std::fs::metadata(&path).with_context(|| format!("Failed to stat layer {path:?}"))?;
        Ok(metadata.len())
    }

    fn layer_path(&self, index: usize) -> Result<PathBuf> {
        let name = self
            .manifest
            .layers
            .get(index)
            .with_context(|| format!("Layer {index} is not in the manifest"))?;
        Ok(self.dir.join(name))
    }

    /// Opens a layer archive for reading.  `wrap` can interpose on the file, for example to
    /// report progress.
    pub fn open_layer<R: Read>(
        &self,
        index: usize,
        wrap: impl FnOnce(File) -> R,
    ) -> Result<Layer<R>> {
        let path = self.layer_path(index)?;
        let file = File::open(&path)
            .with_context(|| format!("Failed to open layer {index} ({path:?})"))?;
        Ok(Layer::new(index, &self.manifest.layers[index], wrap(file)))
    }
}
