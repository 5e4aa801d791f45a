//! External image tooling.
//!
//! Exporting an image and asking for its layer identifiers are the only things the pipeline
//! needs from a container engine.  [`ImageTool`] captures exactly that, so the rest of the crate
//! can run against fixtures, and [`DockerCli`] implements it by running the `docker` program.

use std::{
    borrow::Cow,
    ffi::OsString,
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::util::{check_status, command_line};

/// The operations the squash pipeline needs from a container engine.
pub trait ImageTool {
    /// Exports `image` and extracts the resulting archive into the existing directory `dest`.
    fn save(&self, image: &str, dest: &Path) -> Result<()>;

    /// Returns the ordered (oldest first) layer identifiers of each image, in request order.
    fn layer_ids(&self, images: &[&str]) -> Result<Vec<Vec<String>>>;
}

/// Appends the `latest` tag to image references that don't carry a tag or digest.
///
/// Only the last path component is checked for a `:` so that registry ports
/// (`localhost:5000/app`) aren't mistaken for a tag.
pub fn with_default_tag(image: &str) -> Cow<'_, str> {
    let name = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || name.contains(':') {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(format!("{image}:latest"))
    }
}

#[derive(Debug, Deserialize)]
struct Inspection {
    #[serde(rename = "RootFS")]
    root_fs: InspectionRootFs,
}

#[derive(Debug, Deserialize)]
struct InspectionRootFs {
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// [`ImageTool`] backed by the docker command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: OsString,
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli::new("docker")
    }
}

impl DockerCli {
    /// Uses `program` in place of `docker`; anything accepting the same `save` and `inspect`
    /// arguments works.
    pub fn new(program: impl Into<OsString>) -> Self {
        DockerCli {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stderr(Stdio::inherit());
        command
    }
}

impl ImageTool for DockerCli {
    fn save(&self, image: &str, dest: &Path) -> Result<()> {
        let mut command = self.command();
        command.arg("save").arg(image).stdout(Stdio::piped());
        debug!("running {}", command_line(&command));

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to run {}", command_line(&command)))?;
        let stdout = child
            .stdout
            .take()
            .context("Child process has no stdout")?;

        // The archive owns the pipe and closes it when dropped, so a failed extraction can't
        // leave the exporter blocked on a full pipe while we wait for it.
        let unpacked = tar::Archive::new(stdout).unpack(dest);
        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", command_line(&command)))?;

        // A failed extraction closes the pipe and usually kills the exporter too, so its exit
        // status is a symptom rather than the cause.
        if let Err(err) = unpacked {
            return Err(err).with_context(|| {
                format!(
                    "Failed to extract saved image into {dest:?} ({} exited with {status})",
                    command_line(&command)
                )
            });
        }
        check_status(&command, status)
    }

    fn layer_ids(&self, images: &[&str]) -> Result<Vec<Vec<String>>> {
        let mut command = self.command();
        command.args(["inspect", "--type", "image"]).args(images);
        debug!("running {}", command_line(&command));

        let output = command
            .output()
            .with_context(|| format!("Failed to run {}", command_line(&command)))?;
        check_status(&command, output.status)?;

        let inspected: Vec<Inspection> = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse output of {}", command_line(&command)))?;
        Ok(inspected
            .into_iter()
            .map(|inspection| inspection.root_fs.layers)
            .collect())
    }
}
