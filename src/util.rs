use std::{
    io::{Result, Write},
    path::Path,
    process::{Command, ExitStatus},
};

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Formats a command and its arguments for messages, like "docker save app:latest".
pub fn command_line(command: &Command) -> String {
    let mut line = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Turns an unsuccessful exit status of `command` into [`Error::CommandFailed`].
pub fn check_status(command: &Command, status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: command_line(command),
            status,
        }
        .into())
    }
}

/// The directory containing `path`, which is "." for a bare file name.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Sets up logging for the command line programs.
///
/// Informational messages are shown by default and suppressed by `quiet`; `RUST_LOG` overrides
/// both.
pub fn init_logging(quiet: bool) {
    let level = if quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// A writer which computes the SHA-256 digest of everything passing through it.
pub struct Sha256Writer<W: Write> {
    inner: W,
    context: Sha256,
}

impl<W: Write> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Sha256Writer {
            inner,
            context: Sha256::new(),
        }
    }

    /// Returns the inner writer and the digest of the data written so far.
    pub fn finish(self) -> (W, [u8; 32]) {
        (self.inner, self.context.finalize().into())
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
