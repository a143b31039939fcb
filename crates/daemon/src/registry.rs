//! Registry of every file the daemon has seen.
//!
//! The ingest loop admits and polls files here; the orchestrator moves a
//! claimed file through its states. Claiming is the only way into
//! processing, so a path reported twice is never processed twice at once.

use crate::stability::FileSnapshot;
use crate::watched::{FileState, TransitionError, WatchedFile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// Counts of tracked files by coarse state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub pending: usize,
    pub stable: usize,
    pub claimed: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Arc<Mutex<HashMap<PathBuf, WatchedFile>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchedFile>> {
        // A panic while holding the lock leaves the map itself intact.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking `path`. Returns true if it is now `Pending`.
    ///
    /// In-flight and `Failed` files are left alone. `Done` and `Skipped`
    /// files come back as `Pending` only when their content changed.
    pub fn admit(&self, path: &Path, snapshot: FileSnapshot, now: SystemTime) -> bool {
        let mut files = self.lock();
        match files.get(path) {
            None => {}
            Some(existing) => match existing.state {
                FileState::Done | FileState::Skipped if existing.snapshot != snapshot => {}
                _ => return false,
            },
        }
        files.insert(
            path.to_path_buf(),
            WatchedFile::new(path.to_path_buf(), snapshot, now),
        );
        true
    }

    /// Poll every waiting file once.
    ///
    /// `snapshot_of` reads the current size/mtime; files it cannot read
    /// (deleted or renamed away) are forgotten. Returns the paths that
    /// became `Stable` on this poll.
    pub fn poll<F>(&self, now: SystemTime, stable_polls: u32, mut snapshot_of: F) -> Vec<PathBuf>
    where
        F: FnMut(&Path) -> Option<FileSnapshot>,
    {
        let mut files = self.lock();
        let mut gone = Vec::new();
        let mut settled = Vec::new();

        for (path, file) in files.iter_mut() {
            if !matches!(file.state, FileState::Pending | FileState::Stable) {
                continue;
            }
            match snapshot_of(path.as_path()) {
                Some(snapshot) => {
                    if file.observe(snapshot, now, stable_polls) {
                        settled.push(path.clone());
                    }
                }
                None => gone.push(path.clone()),
            }
        }

        for path in gone {
            tracing::debug!(path = %path.display(), "file vanished before settling");
            files.remove(&path);
        }
        settled
    }

    /// Claim `path` for processing. Only a `Stable` file can be claimed.
    pub fn claim(&self, path: &Path) -> bool {
        let mut files = self.lock();
        match files.get_mut(path) {
            Some(file) if file.state == FileState::Stable => file.transition(FileState::Claimed).is_ok(),
            _ => false,
        }
    }

    /// Claim every `Stable` file; returns them in path order.
    pub fn claim_all_stable(&self) -> Vec<PathBuf> {
        let mut files = self.lock();
        let mut claimed: Vec<PathBuf> = files
            .values_mut()
            .filter(|f| f.state == FileState::Stable)
            .filter_map(|f| f.transition(FileState::Claimed).ok().map(|_| f.path.clone()))
            .collect();
        claimed.sort();
        claimed
    }

    pub fn set_state(&self, path: &Path, next: FileState) -> Result<(), TransitionError> {
        let mut files = self.lock();
        match files.get_mut(path) {
            Some(file) => file.transition(next),
            // Untracked paths behave as if they were freshly pending.
            None => Err(TransitionError {
                from: FileState::Pending,
                to: next,
            }),
        }
    }

    pub fn get(&self, path: &Path) -> Option<WatchedFile> {
        self.lock().get(path).cloned()
    }

    pub fn state(&self, path: &Path) -> Option<FileState> {
        self.lock().get(path).map(|f| f.state)
    }

    /// Drop `Done` and `Skipped` entries whose file is gone.
    ///
    /// `Failed` entries stay so a failed path is never retried. Returns how
    /// many entries were removed.
    pub fn prune_finished<F>(&self, mut exists: F) -> usize
    where
        F: FnMut(&Path) -> bool,
    {
        let mut files = self.lock();
        let before = files.len();
        files.retain(|path, file| {
            !matches!(file.state, FileState::Done | FileState::Skipped) || exists(path.as_path())
        });
        before - files.len()
    }

    pub fn counts(&self) -> RegistryCounts {
        let files = self.lock();
        let mut counts = RegistryCounts::default();
        for file in files.values() {
            match file.state {
                FileState::Pending => counts.pending += 1,
                FileState::Stable => counts.stable += 1,
                FileState::Claimed => counts.claimed += 1,
                FileState::Done => counts.done += 1,
                FileState::Failed => counts.failed += 1,
                FileState::Skipped => counts.skipped += 1,
                _ => counts.in_flight += 1,
            }
        }
        counts
    }
}
