//! Packaging a squashed archive as a slug.
//!
//! A slug is a gzip compressed tarball holding the deployment metadata as `METADATA/conf` and the
//! squashed filesystem as `diff.tar`.  The compression is left to the system `tar`, which also
//! dereferences the symlink standing in for `diff.tar` so the (possibly large) archive is never
//! copied.

use std::{
    fs::{create_dir, read, write},
    path::Path,
    process::Command,
};

use anyhow::{bail, Context, Result};
use log::info;
use rustix::fs::{symlinkat, CWD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::util::{check_status, command_line, parent_dir};

pub const METADATA_DIR: &str = "METADATA";
pub const METADATA_CONF: &str = "conf";
pub const DIFF_TAR: &str = "diff.tar";

/// The fields of a slug's `METADATA/conf` this crate knows about.
///
/// The configuration is copied into the slug byte for byte and packaging only requires it to be
/// a JSON object (see [`check_conf`]).  Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlugMetadata {
    pub name: String,
    pub version: i64,
    pub parent: String,
    pub source: String,
    pub regular_access: bool,
    pub isolated_access: bool,
    pub interfaces: Value,
    pub application: Value,
    pub metadata: Value,
    pub cgroup: Value,
    pub mounts: Option<Vec<Value>>,
    pub overlays: Option<Vec<Value>>,
}

impl SlugMetadata {
    /// Parses a slug configuration, failing if a known field has the wrong type.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(check_conf(data)?))?)
    }
}

/// Checks that `data` is a JSON object, without looking at its fields.
pub fn check_conf(data: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice(data)? {
        Value::Object(object) => Ok(object),
        _ => bail!("slug configuration is not a JSON object"),
    }
}

/// Creates the slug `tgz_path` from the squashed archive `tar_path` and the slug configuration
/// `metadata_path`.
pub fn make_slug(tar_path: &Path, metadata_path: &Path, tgz_path: &Path) -> Result<()> {
    // tar runs in the staging directory: every path handed to it must be absolute
    let tar_path =
        std::path::absolute(tar_path).with_context(|| format!("Failed to resolve {tar_path:?}"))?;
    let tgz = std::path::absolute(tgz_path)
        .with_context(|| format!("Failed to resolve {tgz_path:?}"))?;
    std::fs::metadata(&tar_path).with_context(|| format!("Failed to access {tar_path:?}"))?;

    let conf = read(metadata_path).with_context(|| format!("Failed to read {metadata_path:?}"))?;
    let object = check_conf(&conf)
        .with_context(|| format!("Failed to parse slug configuration {metadata_path:?}"))?;
    let name = object.get("name").and_then(Value::as_str).unwrap_or_default();

    let workdir = parent_dir(tgz_path);
    let tmp = TempDir::with_prefix_in("tmp", workdir)
        .with_context(|| format!("Failed to create temporary directory in {workdir:?}"))?;

    let metadata_dir = tmp.path().join(METADATA_DIR);
    create_dir(&metadata_dir).with_context(|| format!("Failed to create {metadata_dir:?}"))?;
    let conf_path = metadata_dir.join(METADATA_CONF);
    write(&conf_path, &conf).with_context(|| format!("Failed to write {conf_path:?}"))?;

    let link = tmp.path().join(DIFF_TAR);
    symlinkat(&tar_path, CWD, &link).with_context(|| format!("Failed to create {link:?}"))?;

    let mut command = Command::new("tar");
    command
        .arg("-h")
        .arg("-C")
        .arg(tmp.path())
        .arg("-czf")
        .arg(&tgz)
        .arg(".");
    info!("creating slug {} for {name:?}", tgz_path.display());
    let status = command
        .status()
        .with_context(|| format!("Failed to run {}", command_line(&command)))?;
    check_status(&command, status)
}
