//! Stability checking for files that may still be written to.
//!
//! A file is only handed to the orchestrator once its size and modification
//! time have stopped changing across consecutive polls.

use std::path::Path;
use std::time::SystemTime;

/// Size and mtime of a file at one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl FileSnapshot {
    /// Read the current snapshot of `path`.
    pub fn of(path: &Path) -> Result<Self, std::io::Error> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            mtime: metadata.modified().ok(),
        })
    }
}

/// Result of comparing two polls of the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size and mtime unchanged between polls.
    Stable,
    /// Something changed between polls.
    Unstable {
        previous: FileSnapshot,
        current: FileSnapshot,
    },
}

/// Compare two snapshots of the same file.
///
/// This is a pure function extracted for property testing.
#[inline]
pub fn compare_snapshots(previous: FileSnapshot, current: FileSnapshot) -> StabilityResult {
    if previous == current {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable { previous, current }
    }
}
