//! Single-instance lock file.
//!
//! The lock file holds the pid of the running daemon. Deleting it is the
//! shutdown request: the owner notices the deletion on its watcher tick
//! and stops, freeing the port for a replacement instance. The `stop`
//! subcommand additionally delivers a SIGTERM so shutdown does not wait
//! for the next tick.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info};

pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Claims the lock for this process by writing its pid.
    pub fn acquire(path: &Path) -> Result<Self> {
        fs::write(path, std::process::id().to_string())
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// Completes once the lock file disappears, meaning another instance
    /// (or `stop`) has requested shutdown.
    pub async fn watch(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !self.path.exists() {
                info!("lock file removed, shutting down");
                return;
            }
        }
    }

    pub fn release(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Asks a previously started daemon to stop: SIGTERM to the pid recorded
/// in the lock file, then remove the file.
pub fn stop_running_instance(path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no running instance ({} is missing)", path.display()))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .context("lock file does not contain a pid")?;

    debug!(pid, "sending SIGTERM to running instance");
    nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal pid {pid}"))?;

    let _ = fs::remove_file(path);
    Ok(())
}
