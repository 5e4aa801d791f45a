//! The `image-export` pipeline: save an image, pick its layers and squash them into one archive.

use std::{
    fs::{create_dir, Permissions},
    io::BufWriter,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use tempfile::TempDir;

use crate::{
    saved::SavedImage,
    selection::Selection,
    squash::{squash, SquashStats},
    tool::{with_default_tag, ImageTool},
    util::{parent_dir, Sha256Writer},
};

/// How to export an image.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Only squash the layers the image adds on top of this one.
    pub base_image: Option<String>,
    /// Reuse the extracted output of an earlier save instead of saving the image again.
    pub save_dir: Option<PathBuf>,
    /// Only squash this many of the newest layers.  Takes precedence over `base_image`.
    pub layer_count: Option<usize>,
    /// Show a progress bar while squashing.
    pub progress: bool,
}

/// The outcome of a successful export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// The image reference as exported, with its default tag applied.
    pub image: String,
    /// The number of layers squashed.
    pub layers: usize,
    pub stats: SquashStats,
    /// SHA-256 digest of the output archive.
    pub sha256: [u8; 32],
}

fn progress_bar(enabled: bool, total: u64) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[eta {eta}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} {msg}",
    ) {
        bar.set_style(style.progress_chars("##-"));
    }
    bar
}

/// Exports `image` with `tool` and writes the squash of its selected layers to `output`.
///
/// Temporary files are created next to `output`.  The output archive is only created once the
/// squash has completed; on failure nothing is left behind.
pub fn export_image(
    tool: &impl ImageTool,
    image: &str,
    output: &Path,
    options: &ExportOptions,
) -> Result<ExportReport> {
    let image = with_default_tag(image).into_owned();
    let workdir = parent_dir(output);

    // Dropping the TempDir removes the save, whichever way we leave this function.
    let mut tempdir: Option<TempDir> = None;
    let saved = match &options.save_dir {
        Some(dir) => SavedImage::open(dir)?,
        None => {
            let tmp = TempDir::with_prefix_in("tmp", workdir)
                .with_context(|| format!("Failed to create temporary directory in {workdir:?}"))?;
            let dir = tmp.path().join("save");
            create_dir(&dir).with_context(|| format!("Failed to create {dir:?}"))?;
            info!("saving {image}");
            tool.save(&image, &dir)
                .with_context(|| format!("Failed to save {image}"))?;
            tempdir = Some(tmp);
            SavedImage::open(dir)?
        }
    };

    let selection = Selection::new(options.layer_count, options.base_image.as_deref());
    let count = selection.resolve(&image, &saved, tool)?;
    let selected = saved.newest(count);
    info!(
        "combining {} of {} layers of {image}",
        selected.len(),
        saved.layer_count()
    );

    let mut total = 0;
    for index in selected.clone() {
        total += saved.layer_size(index)?;
    }
    let bar = progress_bar(options.progress, total);

    let file = tempfile::Builder::new()
        .prefix(".imgsquash")
        .permissions(Permissions::from_mode(0o644))
        .tempfile_in(workdir)
        .with_context(|| format!("Failed to create temporary output in {workdir:?}"))?;
    let layers = selected
        .clone()
        .rev()
        .map(|index| saved.open_layer(index, |file| bar.wrap_read(file)));
    let (writer, stats) = squash(layers, Sha256Writer::new(BufWriter::new(file)))
        .with_context(|| format!("Failed to combine layers of {image}"))?;
    bar.finish_and_clear();

    let (buffered, sha256) = writer.finish();
    let file = buffered
        .into_inner()
        .map_err(|err| err.into_error())
        .with_context(|| format!("Failed to write {output:?}"))?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("Failed to write {output:?}"))?;
    file.persist(output)
        .with_context(|| format!("Failed to create {output:?}"))?;

    drop(tempdir);

    Ok(ExportReport {
        image,
        layers: selected.len(),
        stats,
        sha256,
    })
}
