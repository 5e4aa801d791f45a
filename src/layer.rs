//! Sequential reading of a single layer archive.

use std::{
    ffi::OsStr,
    io::Read,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use tar::{Archive, Entry, EntryType};

use crate::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Normalizes an archive path for comparison.
///
/// Layer archives spell the same path in different ways (`etc/`, `./etc`, `/etc`), so leading
/// `/` and `./` are dropped along with any trailing `/`.  `..` components are kept as-is.
pub fn path_key(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir | Component::Prefix(..)))
        .collect()
}

/// What a layer entry means for the squash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    /// Some other real entry (device, fifo, ...) that is copied like any file.
    Other,
    /// A `.wh.<name>` marker.  Contains the normalized path it deletes.
    Whiteout(PathBuf),
    /// A `.wh..wh.opq` marker.  Contains the normalized path it deletes, which is the
    /// `.wh.opq` sibling rather than the directory contents.
    OpaqueWhiteout(PathBuf),
    /// Archive metadata (global pax headers and the like) that never describes a path.
    Metadata,
}

impl EntryKind {
    /// Classifies an entry from its path and tar entry type.
    pub fn classify(path: &Path, entry_type: EntryType) -> Self {
        if let Some(name) = path.file_name() {
            let name = name.as_bytes();
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                let deleted = path_key(&path.with_file_name(OsStr::from_bytes(target)));
                return if name == OPAQUE_WHITEOUT {
                    EntryKind::OpaqueWhiteout(deleted)
                } else {
                    EntryKind::Whiteout(deleted)
                };
            }
        }

        match entry_type {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            EntryType::Link => EntryKind::Hardlink,
            // Per-entry pax and GNU long name records are folded into the entry they describe
            // by `Archive::entries`; only global pax headers surface as entries of their own.
            EntryType::XGlobalHeader => EntryKind::Metadata,
            _ => EntryKind::Other,
        }
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self, EntryKind::Whiteout(_) | EntryKind::OpaqueWhiteout(_))
    }
}

/// One entry of a layer archive, with its content still unread.
pub struct LayerEntry<'a, R: Read> {
    /// The normalized path, see [`path_key`].
    pub key: PathBuf,
    pub kind: EntryKind,
    pub entry: Entry<'a, R>,
}

/// A layer archive of a saved image.
///
/// The ordinal counts from the oldest layer (0) upwards.  A layer is read exactly once, front to
/// back, and dropped afterwards.
pub struct Layer<R: Read> {
    index: usize,
    name: String,
    archive: Archive<R>,
}

impl<R: Read> Layer<R> {
    pub fn new(index: usize, name: impl Into<String>, reader: R) -> Self {
        Layer {
            index,
            name: name.into(),
            archive: Archive::new(reader),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The archive's file name inside the save directory, for messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates the entries in archive order.  Content is only read if the caller reads it.
    pub fn entries(&mut self) -> Result<impl Iterator<Item = Result<LayerEntry<'_, R>>>> {
        let entries = self.archive.entries().context("Reading archive header")?;

        Ok(entries.map(|entry| {
            let entry = entry.context("Reading archive entry")?;
            let (key, kind) = {
                let path = entry.path().context("Decoding entry path")?;
                let kind = EntryKind::classify(&path, entry.header().entry_type());
                (path_key(&path), kind)
            };
            Ok(LayerEntry { key, kind, entry })
        }))
    }
}
