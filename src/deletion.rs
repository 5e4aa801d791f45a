//! The set of paths deleted by whiteouts in newer layers.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

/// Paths hidden from older layers by a whiteout in a newer layer.
///
/// A recorded path masks itself and, recursively, everything below it: recording `usr/share`
/// hides `usr/share` and `usr/share/doc/README` but not `usr/shared`.
///
/// Paths are expected in the normalized form produced by [`crate::layer::path_key`].  They are
/// kept sorted and are never removed; an index lives for exactly one squash.
#[derive(Debug, Default)]
pub struct DeletionIndex {
    paths: BTreeSet<PathBuf>,
}

impl DeletionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a deleted path.  Returns false if it was already present.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    /// Checks if `path` or any of its parent directories has been deleted.
    pub fn is_masked(&self, path: &Path) -> bool {
        if self.paths.is_empty() {
            return false;
        }

        // Path comparison is per component, so an ancestor only matches on a separator boundary.
        path.ancestors()
            .take_while(|ancestor| !ancestor.as_os_str().is_empty())
            .any(|ancestor| self.paths.contains(ancestor))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// The recorded paths, in sorted order.
    ///
    /// Paths are ordered component by component rather than as strings, so `a/b` sorts before
    /// `a-b`.  This keeps a directory next to its descendants.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }
}
