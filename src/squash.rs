//! The layer squash engine.
//!
//! Layers are consumed from the newest to the oldest.  Every entry is checked against the
//! whiteouts seen so far and against the paths already written, so the first (newest) version
//! of each path wins and anything deleted by a newer layer never makes it to the output.
//!
//! Whiteouts only apply to strictly older layers: the markers of a layer are collected while it
//! is read and recorded in the [`DeletionIndex`] once the layer is complete.  A layer that both
//! deletes and recreates a path therefore keeps its own version.

use std::{
    collections::HashSet,
    ffi::OsStr,
    io::{Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info};
use tar::{Builder, Entry, EntryType};

use crate::{
    deletion::DeletionIndex,
    error::Error,
    layer::{EntryKind, Layer, LayerEntry},
};

/// Paths already committed to the output archive.
#[derive(Debug, Default)]
pub struct WrittenPaths {
    paths: HashSet<PathBuf>,
}

impl WrittenPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for the output.  Returns false if it was claimed before.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Counters describing one squash run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SquashStats {
    pub layers: usize,
    /// Entries read from all layers, including markers.
    pub entries: usize,
    pub written: usize,
    /// Entries hidden by a whiteout in a newer layer.
    pub masked: usize,
    pub whiteouts: usize,
    pub opaque_whiteouts: usize,
    /// Entries for paths a newer layer already provided.
    pub duplicates: usize,
    /// Archive metadata entries that describe no path.
    pub skipped: usize,
}

/// Copies one entry to the output, keeping its header as close to the original as possible.
///
/// Headers are copied verbatim when they hold the full path and link target.  Otherwise the long
/// forms are re-emitted by the builder.  Pax extension records (xattrs, long names, ...) are
/// written ahead of the entry just as they appeared in the source.
fn copy_entry<W: Write, R: Read>(
    builder: &mut Builder<W>,
    entry: &mut Entry<'_, R>,
) -> Result<()> {
    let mut pax = vec![];
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let key = extension.key().context("Pax extension key is not UTF-8")?;
            pax.push((key.to_string(), extension.value_bytes().to_vec()));
        }
    }
    if !pax.is_empty() {
        builder.append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
    }

    let mut header = entry.header().clone();
    let path = entry.path_bytes().into_owned();
    let long_path = path != header.path_bytes().as_ref();

    let is_link = matches!(header.entry_type(), EntryType::Link | EntryType::Symlink);
    let link = match entry.link_name_bytes() {
        Some(link) if is_link => Some(link.into_owned()),
        _ => None,
    };
    let long_link = link.as_deref() != header.link_name_bytes().as_deref().filter(|_| is_link);

    let path = Path::new(OsStr::from_bytes(&path));
    match link {
        Some(ref target) if long_path || long_link => {
            builder.append_link(&mut header, path, Path::new(OsStr::from_bytes(target)))?;
        }
        None if long_path => {
            builder.append_data(&mut header, path, entry)?;
        }
        _ => {
            builder.append(&header, entry)?;
        }
    }

    Ok(())
}

/// Incremental squash of layers into one archive.
///
/// The deletion index and the written-path set live inside the squasher and are dropped with it:
/// each run starts from nothing.
pub struct Squasher<W: Write> {
    builder: Builder<W>,
    deleted: DeletionIndex,
    written: WrittenPaths,
    previous: Option<usize>,
    stats: SquashStats,
}

impl<W: Write> Squasher<W> {
    pub fn new(output: W) -> Self {
        Squasher {
            builder: Builder::new(output),
            deleted: DeletionIndex::new(),
            written: WrittenPaths::new(),
            previous: None,
            stats: SquashStats::default(),
        }
    }

    /// Consumes the next layer.  Each layer must be older than the one added before it.
    pub fn add_layer<R: Read>(&mut self, mut layer: Layer<R>) -> Result<()> {
        let index = layer.index();
        if let Some(previous) = self.previous {
            if index >= previous {
                return Err(Error::LayerOrder {
                    previous,
                    next: index,
                }
                .into());
            }
        }
        self.previous = Some(index);

        let name = layer.name().to_string();
        info!("squashing layer {index} ({name})");

        let mut pending = vec![];
        let entries = layer
            .entries()
            .with_context(|| format!("Failed to read layer {index} ({name})"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read layer {index} ({name})"))?;
            let path = entry.key.clone();
            self.process_entry(entry, &mut pending).with_context(|| {
                format!("Failed to copy {path:?} from layer {index} ({name})")
            })?;
        }

        for path in pending {
            self.deleted.insert(path);
        }
        self.stats.layers += 1;

        Ok(())
    }

    fn process_entry<R: Read>(
        &mut self,
        mut entry: LayerEntry<'_, R>,
        pending: &mut Vec<PathBuf>,
    ) -> Result<()> {
        self.stats.entries += 1;

        if self.deleted.is_masked(&entry.key) {
            debug!("{:?}: deleted by a newer layer", entry.key);
            self.stats.masked += 1;
            return Ok(());
        }

        match entry.kind {
            EntryKind::Whiteout(path) => {
                debug!("{path:?}: whiteout");
                self.stats.whiteouts += 1;
                pending.push(path);
                return Ok(());
            }
            EntryKind::OpaqueWhiteout(path) => {
                // Recorded like a plain whiteout: only the `.wh.opq` sibling gets hidden, the
                // directory's older contents stay visible.
                debug!("{:?}: opaque whiteout, hiding {path:?} only", entry.key);
                self.stats.opaque_whiteouts += 1;
                pending.push(path);
                return Ok(());
            }
            EntryKind::Metadata => {
                self.stats.skipped += 1;
                return Ok(());
            }
            _ => {}
        }

        if !self.written.insert(entry.key) {
            self.stats.duplicates += 1;
            return Ok(());
        }

        copy_entry(&mut self.builder, &mut entry.entry)?;
        self.stats.written += 1;

        Ok(())
    }

    /// Paths written so far.
    pub fn written(&self) -> &WrittenPaths {
        &self.written
    }

    /// Paths deleted so far.
    pub fn deleted(&self) -> &DeletionIndex {
        &self.deleted
    }

    /// Writes the archive trailer and hands back the output.
    pub fn finish(self) -> Result<(W, SquashStats)> {
        let output = self
            .builder
            .into_inner()
            .context("Failed to finish output archive")?;
        Ok((output, self.stats))
    }
}

/// Squashes `layers`, given newest first, into a single archive written to `output`.
///
/// Any failure to open or read a layer aborts the squash; the output is incomplete at that
/// point and must be discarded.
pub fn squash<R, W>(
    layers: impl IntoIterator<Item = Result<Layer<R>>>,
    output: W,
) -> Result<(W, SquashStats)>
where
    R: Read,
    W: Write,
{
    let mut squasher = Squasher::new(output);
    for layer in layers {
        squasher.add_layer(layer?)?;
    }
    let (output, stats) = squasher.finish()?;

    info!(
        "wrote {} entries from {} layers ({} deleted, {} shadowed)",
        stats.written, stats.layers, stats.masked, stats.duplicates
    );
    if stats.opaque_whiteouts > 0 {
        debug!(
            "{} opaque whiteouts were treated as plain whiteouts",
            stats.opaque_whiteouts
        );
    }

    Ok((output, stats))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{archive_paths, newest_first, read_archive, LayerBuilder};

    fn squash_all(archives: &[Vec<u8>]) -> (Vec<u8>, SquashStats) {
        squash(newest_first(archives), vec![]).unwrap()
    }

    fn content_of(output: &[u8], path: &str) -> Option<Vec<u8>> {
        read_archive(output)
            .into_iter()
            .find(|e| e.path == path)
            .map(|e| e.content)
    }

    #[test]
    fn test_written_paths() {
        let mut written = WrittenPaths::new();
        assert!(written.is_empty());
        assert!(written.insert("a/b"));
        assert!(!written.insert("a/b"));
        assert!(written.contains(Path::new("a/b")));
        assert!(!written.contains(Path::new("a")));
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn test_union_of_layers() {
        let layers = [
            LayerBuilder::new().file("a", b"x").build(),
            LayerBuilder::new().file("b", b"y").build(),
        ];
        let (output, stats) = squash_all(&layers);

        // newest layer first
        assert_eq!(archive_paths(&output), ["b", "a"]);
        assert_eq!(content_of(&output, "a").unwrap(), b"x");
        assert_eq!(content_of(&output, "b").unwrap(), b"y");
        assert_eq!(stats.layers, 2);
        assert_eq!(stats.written, 2);
    }

    #[test]
    fn test_whiteout_directory() {
        let layers = [
            LayerBuilder::new()
                .dir("dir")
                .file("dir/f", b"gone")
                .file("keep", b"kept")
                .build(),
            LayerBuilder::new().whiteout("dir").build(),
        ];
        let (output, stats) = squash_all(&layers);

        assert_eq!(archive_paths(&output), ["keep"]);
        assert_eq!(stats.whiteouts, 1);
        assert_eq!(stats.masked, 2);
    }

    #[test]
    fn test_newest_wins() {
        let layers = [
            LayerBuilder::new().file_with_mode("a", b"old", 0o600).build(),
            LayerBuilder::new().file_with_mode("a", b"new", 0o755).build(),
        ];
        let (output, stats) = squash_all(&layers);

        let entries = read_archive(&output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, b"new");
        assert_eq!(entries[0].mode, 0o755);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_markers_never_written() {
        let layers = [
            LayerBuilder::new().file("etc/motd", b"hi").build(),
            LayerBuilder::new()
                .whiteout("etc/motd")
                .whiteout("never/existed")
                .opaque("var")
                .build(),
        ];
        let (output, _) = squash_all(&layers);

        assert!(archive_paths(&output).iter().all(|p| !p.contains(".wh.")));
        assert_eq!(archive_paths(&output), Vec::<String>::new());
    }

    #[test]
    fn test_same_layer_whiteout_keeps_recreated_path() {
        // A layer which replaced a directory carries both the marker and the new content, in
        // either order.  Only the older layer's version goes away.
        let layers = [
            LayerBuilder::new().dir("opt").file("opt/old", b"1").build(),
            LayerBuilder::new()
                .whiteout("opt")
                .dir("opt")
                .file("opt/new", b"2")
                .build(),
        ];
        let (output, _) = squash_all(&layers);
        assert_eq!(archive_paths(&output), ["opt", "opt/new"]);
    }

    #[test]
    fn test_squasher_state_between_layers() -> Result<()> {
        let upper = LayerBuilder::new()
            .whiteout("var/log")
            .file("var/log/new", b"1")
            .build();
        let lower = LayerBuilder::new().file("var/log/old", b"0").build();

        let mut squasher = Squasher::new(vec![]);
        squasher.add_layer(Layer::new(1, "upper", upper.as_slice()))?;
        assert!(squasher.written().contains(Path::new("var/log/new")));
        assert!(squasher.deleted().is_masked(Path::new("var/log/old")));
        assert_eq!(squasher.written().len(), 1);
        assert_eq!(squasher.deleted().len(), 1);

        squasher.add_layer(Layer::new(0, "lower", lower.as_slice()))?;
        assert!(!squasher.written().contains(Path::new("var/log/old")));
        let (output, stats) = squasher.finish()?;
        assert_eq!(archive_paths(&output), ["var/log/new"]);
        assert_eq!(stats.masked, 1);
        Ok(())
    }

    #[test]
    fn test_whiteout_in_older_layer_is_ignored_for_written_path() {
        let layers = [
            LayerBuilder::new().file("a/older", b"1").build(),
            LayerBuilder::new().whiteout("a").build(),
            LayerBuilder::new().dir("a").file("a/newest", b"3").build(),
        ];
        let (output, _) = squash_all(&layers);
        assert_eq!(archive_paths(&output), ["a", "a/newest"]);
    }

    #[test]
    fn test_prefix_is_not_ancestor() {
        let layers = [
            LayerBuilder::new()
                .file("usr/lib", b"file")
                .file("usr/lib64/libc.so", b"elf")
                .build(),
            LayerBuilder::new().whiteout("usr/lib").build(),
        ];
        let (output, _) = squash_all(&layers);
        assert_eq!(archive_paths(&output), ["usr/lib64/libc.so"]);
    }

    #[test]
    fn test_opaque_whiteout_preserves_lower_contents() {
        let layers = [
            LayerBuilder::new().dir("var").file("var/lower", b"l").build(),
            LayerBuilder::new().opaque("var").file("var/upper", b"u").build(),
        ];
        let (output, stats) = squash_all(&layers);

        assert_eq!(archive_paths(&output), ["var/upper", "var", "var/lower"]);
        assert_eq!(stats.opaque_whiteouts, 1);
        assert_eq!(stats.whiteouts, 0);
    }

    #[test]
    fn test_equivalent_spellings() {
        let layers = [
            LayerBuilder::new().file("./etc/hosts", b"old").build(),
            LayerBuilder::new().dir("etc/").file("etc/hosts", b"new").build(),
        ];
        let (output, _) = squash_all(&layers);
        assert_eq!(archive_paths(&output), ["etc", "etc/hosts"]);
        assert_eq!(content_of(&output, "etc/hosts").unwrap(), b"new");
    }

    #[test]
    fn test_links_preserved() {
        let layers = [LayerBuilder::new()
            .file("bin/busybox", b"elf")
            .symlink("bin/sh", "busybox")
            .hardlink("bin/ls", "bin/busybox")
            .build()];
        let (output, _) = squash_all(&layers);

        let entries = read_archive(&output);
        assert_eq!(entries[1].entry_type, EntryType::Symlink);
        assert_eq!(entries[1].link.as_deref(), Some("busybox"));
        assert_eq!(entries[2].entry_type, EntryType::Link);
        assert_eq!(entries[2].link.as_deref(), Some("bin/busybox"));
    }

    #[test]
    fn test_long_names_preserved() {
        let dir = "d".repeat(90);
        let long = format!("{dir}/{}", "f".repeat(90));
        let target = format!("/{}", "t".repeat(150));
        let layers = [
            LayerBuilder::new().file(&long, b"old").build(),
            LayerBuilder::new()
                .file(&long, b"new")
                .symlink(&format!("{dir}/link"), &target)
                .build(),
        ];
        let (output, stats) = squash_all(&layers);

        let entries = read_archive(&output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, long);
        assert_eq!(entries[0].content, b"new");
        assert_eq!(entries[1].link.as_deref(), Some(target.as_str()));
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_pax_extensions_preserved() -> Result<()> {
        let layers = [LayerBuilder::new()
            .file_with_pax(
                "usr/bin/ping",
                b"elf",
                &[("SCHILY.xattr.security.capability", b"\x01\x00")],
            )
            .build()];
        let (output, _) = squash_all(&layers);

        let mut archive = tar::Archive::new(output.as_slice());
        let mut entries = archive.entries()?;
        let mut entry = entries.next().unwrap()?;
        assert_eq!(entry.path()?, Path::new("usr/bin/ping"));
        let extensions: Vec<(String, Vec<u8>)> = entry
            .pax_extensions()?
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.key().unwrap().to_string(), e.value_bytes().to_vec())
            })
            .collect();
        assert_eq!(
            extensions,
            [(
                "SCHILY.xattr.security.capability".to_string(),
                b"\x01\x00".to_vec()
            )]
        );
        Ok(())
    }

    #[test]
    fn test_layer_order() {
        let layers = [
            LayerBuilder::new().file("a", b"1").build(),
            LayerBuilder::new().file("b", b"2").build(),
        ];

        let mut squasher = Squasher::new(vec![]);
        squasher
            .add_layer(Layer::new(0, "old", layers[0].as_slice()))
            .unwrap();
        let err = squasher
            .add_layer(Layer::new(1, "new", layers[1].as_slice()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LayerOrder {
                previous: 0,
                next: 1
            })
        ));
    }

    #[test]
    fn test_broken_layer_aborts() {
        let mut broken = LayerBuilder::new().file("big", &[1; 4096]).build();
        broken.truncate(1024);
        let layers = [broken, LayerBuilder::new().file("ok", b"1").build()];

        let err = squash(newest_first(&layers), vec![]).unwrap_err();
        assert!(format!("{err:#}").contains("layer 0 (layer0.tar)"), "{err:#}");
    }

    #[test]
    fn test_open_failure_aborts() {
        let layers = [LayerBuilder::new().file("ok", b"1").build()];
        let failing = std::iter::once(Err(anyhow::anyhow!("no such layer")))
            .chain(newest_first(&layers));
        assert!(squash(failing, vec![]).is_err());
    }

    #[test]
    fn test_fewer_layers_only_drop_older_paths() {
        let layers = [
            LayerBuilder::new().file("base", b"0").file("shared", b"0").build(),
            LayerBuilder::new().file("middle", b"1").build(),
            LayerBuilder::new().file("shared", b"2").file("top", b"2").build(),
        ];
        let (full, _) = squash_all(&layers);
        let (top_two, _) = squash(newest_first(&layers).take(2), vec![]).unwrap();

        let full = archive_paths(&full);
        let top_two = archive_paths(&top_two);
        assert!(top_two.iter().all(|p| full.contains(p)));
        assert_eq!(top_two, ["shared", "top", "middle"]);
        assert_eq!(content_of(&squash_all(&layers).0, "shared").unwrap(), b"2");
    }

    #[test]
    fn test_empty_input() {
        let (output, stats) = squash(newest_first(&[]), vec![]).unwrap();
        assert_eq!(archive_paths(&output), Vec::<String>::new());
        assert_eq!(stats, SquashStats::default());
    }
}
