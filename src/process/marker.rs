//! PID marker file and the lock serializing agent replacement.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{RelayError, Result};

/// Filesystem record of the running agent's PID, as decimal text.
#[derive(Debug, Clone)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no marker exists.
    pub fn read(&self) -> Result<Option<u32>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_pid(contents.trim()).map(Some).ok_or_else(|| {
            RelayError::MalformedInput(format!(
                "marker {} does not hold a pid: {:?}",
                self.path.display(),
                contents.trim()
            ))
        })
    }

    /// Replace the marker atomically (write a sibling file, then rename).
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("pid.{}.tmp", std::process::id()));
        fs::write(&tmp, format!("{}\n", pid))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove the marker. A missing marker is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the marker only if it still names `pid`.
    pub fn remove_if_owned(&self, pid: u32) -> Result<bool> {
        match self.read() {
            Ok(Some(current)) if current == pid => {
                self.remove()?;
                Ok(true)
            }
            Ok(_) | Err(RelayError::MalformedInput(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// PIDs that are safe to signal: 0 and anything above `i32::MAX` would
/// address process groups once cast to `pid_t`.
fn parse_pid(text: &str) -> Option<u32> {
    text.parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0 && *pid <= i32::MAX as u32)
}

/// Exclusive advisory lock on the marker's companion lock file, released on drop.
#[derive(Debug)]
pub struct MarkerLock {
    file: File,
}

impl MarkerLock {
    /// Block until the lock is held.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for MarkerLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release agent lock: {}", e);
        }
    }
}
