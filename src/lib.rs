//! Flatten the layers of a saved container image into a single tar archive.
//!
//! A `docker save` export contains one tar archive per layer.  Unpacking those archives in order
//! on top of each other (honouring whiteouts) gives the filesystem a container sees at runtime.
//! This crate produces the same view without unpacking anything: the layers are walked from the
//! newest to the oldest and each surviving path is copied to the output exactly once.
//!
//! The interesting parts are:
//!
//!  - [`squash`]: the squash engine itself
//!  - [`deletion`]: the index of paths hidden by whiteouts
//!  - [`selection`]: deciding how many of the newest layers to squash
//!  - [`export`]: the pipeline used by the `image-export` program
//!  - [`slug`]: packaging a squashed archive for deployment

pub mod deletion;
pub mod error;
pub mod export;
pub mod layer;
pub mod saved;
pub mod selection;
pub mod slug;
pub mod squash;
pub mod tool;
pub mod util;


/// Base name prefix marking a whiteout entry in a layer archive.
pub const WHITEOUT_PREFIX: &[u8] = b".wh.";

/// Complete base name of an opaque directory whiteout.
pub const OPAQUE_WHITEOUT: &[u8] = b".wh..wh.opq";
