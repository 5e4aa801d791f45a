//! Choosing how many of the newest layers go into the squash.
//!
//! In order of precedence: an explicit count, the layers an image adds on top of a base image,
//! or every layer of the saved image.

use anyhow::Result;
use log::{info, warn};

use crate::{
    error::Error,
    saved::SavedImage,
    tool::{with_default_tag, ImageTool},
};

/// Which layers of the saved image to squash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every layer in the manifest.
    All,
    /// The given number of newest layers.
    Newest(usize),
    /// The layers the image has on top of `base`.
    UniqueTo { base: String },
}

impl Selection {
    /// Picks the selection from the command line options.  An explicit count wins over a base
    /// image.
    pub fn new(layer_count: Option<usize>, base_image: Option<&str>) -> Self {
        match (layer_count, base_image) {
            (Some(count), base) => {
                if let Some(base) = base {
                    warn!("layer count {count} given, not comparing against base image {base}");
                }
                Selection::Newest(count)
            }
            (None, Some(base)) => Selection::UniqueTo {
                base: with_default_tag(base).into_owned(),
            },
            (None, None) => Selection::All,
        }
    }

    /// Determines the number of newest layers of `saved` (an export of `image`) to squash.
    pub fn resolve(&self, image: &str, saved: &SavedImage, tool: &impl ImageTool) -> Result<usize> {
        let total = saved.layer_count();
        match self {
            Selection::All => Ok(total),
            Selection::Newest(count) => {
                if *count > total {
                    warn!("asked for {count} layers but {image} only has {total}, using all");
                }
                Ok((*count).min(total))
            }
            Selection::UniqueTo { base } => {
                let (base_ids, image_ids) = inspect_pair(tool, image, base)?;
                check_correspondence(image, &image_ids, saved)?;
                let count = unique_layer_count(image, base, &base_ids, &image_ids)?;
                info!("{image} has {count} layers on top of {base}");
                Ok(count)
            }
        }
    }
}

/// The number of leading positions at which both identifier lists agree.
pub fn common_prefix_len(base: &[String], derived: &[String]) -> usize {
    base.iter()
        .zip(derived)
        .take_while(|(base, derived)| base == derived)
        .count()
}

/// The number of layers `image` has on top of `base`, given both images' layer identifiers.
pub fn unique_layer_count(
    image: &str,
    base: &str,
    base_ids: &[String],
    image_ids: &[String],
) -> Result<usize, Error> {
    let common = common_prefix_len(base_ids, image_ids);
    if common == 0 {
        Err(Error::NotDerived {
            image: image.to_string(),
            base: base.to_string(),
        })
    } else if common == image_ids.len() {
        Err(Error::IdenticalToBase {
            image: image.to_string(),
            base: base.to_string(),
        })
    } else {
        Ok(image_ids.len() - common)
    }
}

/// Inspects the base image and the image, in that order.
fn inspect_pair(
    tool: &impl ImageTool,
    image: &str,
    base: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut ids = tool.layer_ids(&[base, image])?;
    if ids.len() != 2 {
        return Err(Error::InspectCount {
            expected: 2,
            found: ids.len(),
        }
        .into());
    }

    let image_ids = ids.pop().unwrap_or_default();
    let base_ids = ids.pop().unwrap_or_default();
    for (name, ids) in [(base, &base_ids), (image, &image_ids)] {
        if ids.is_empty() {
            return Err(Error::NoLayers {
                image: name.to_string(),
            }
            .into());
        }
    }

    Ok((base_ids, image_ids))
}

/// Layer archives in the save and inspected identifiers must correspond one to one, or the
/// computed count would pick the wrong archives.
fn check_correspondence(image: &str, image_ids: &[String], saved: &SavedImage) -> Result<()> {
    if image_ids.len() != saved.layer_count() {
        return Err(Error::LayerMismatch {
            image: image.to_string(),
            reason: format!(
                "inspection reports {} layers but the saved image has {} layer archives",
                image_ids.len(),
                saved.layer_count()
            ),
        }
        .into());
    }

    if let Some(diff_ids) = saved.diff_ids()? {
        if diff_ids != image_ids {
            return Err(Error::LayerMismatch {
                image: image.to_string(),
                reason: "inspected layers differ from the saved image configuration".to_string(),
            }
            .into());
        }
    }

    Ok(())
}
