//! Liveness file.
//!
//! The daemon rewrites a small status file on a fixed period. The
//! `healthcheck` subcommand reports healthy while that file is fresh.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("failed to write liveness file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write the current unix time to `path`, refreshing its mtime.
pub fn touch(path: &Path) -> Result<(), LivenessError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    std::fs::write(path, format!("{}\n", now)).map_err(|source| LivenessError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Healthy iff `path` exists and was modified within `stale_after` of `now`.
///
/// An mtime in the future counts as fresh.
pub fn is_healthy(path: &Path, stale_after: Duration, now: SystemTime) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    match now.duration_since(modified) {
        Ok(age) => age <= stale_after,
        Err(_) => true,
    }
}

/// Remove the liveness file; a missing file is fine.
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed liveness file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove liveness file"),
    }
}

/// Touch `path` every `interval` until `shutdown` flips to true.
///
/// Runs on its own task so a long encode never delays it. Write failures
/// are logged and retried on the next tick.
pub async fn run_liveness_loop(path: PathBuf, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = touch(&path) {
                    tracing::warn!(error = %e, "liveness update failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
