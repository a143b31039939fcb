//! Per-file processing state.
//!
//! Every path the daemon has seen is tracked as a [`WatchedFile`] whose
//! [`FileState`] only moves along the edges allowed by
//! [`FileState::can_transition_to`].

use crate::stability::{compare_snapshots, FileSnapshot, StabilityResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;

/// Processing state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Seen, still waiting for size and mtime to settle.
    Pending,
    /// Settled; waiting for a free worker.
    Stable,
    /// Owned by a worker.
    Claimed,
    Probing,
    Planning,
    /// Running candidate plan `i`.
    Encoding(usize),
    Finalizing,
    Done,
    Failed,
    /// Not a UHD source; nothing to do.
    Skipped,
}

impl FileState {
    /// Terminal states are never left within one process lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Done | FileState::Failed | FileState::Skipped)
    }

    /// Claimed through Finalizing.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            FileState::Claimed
                | FileState::Probing
                | FileState::Planning
                | FileState::Encoding(_)
                | FileState::Finalizing
        )
    }

    pub fn can_transition_to(&self, next: FileState) -> bool {
        use FileState::*;
        match (*self, next) {
            (Pending, Stable) => true,
            (Stable, Pending) | (Stable, Claimed) => true,
            // Output already present.
            (Claimed, Done) => true,
            (Claimed, Probing) | (Claimed, Failed) => true,
            (Probing, Planning) | (Probing, Failed) | (Probing, Skipped) => true,
            (Planning, Encoding(0)) | (Planning, Failed) => true,
            (Encoding(i), Encoding(j)) => j == i + 1,
            (Encoding(_), Finalizing) | (Encoding(_), Failed) => true,
            (Finalizing, Done) | (Finalizing, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileState::Pending => write!(f, "pending"),
            FileState::Stable => write!(f, "stable"),
            FileState::Claimed => write!(f, "claimed"),
            FileState::Probing => write!(f, "probing"),
            FileState::Planning => write!(f, "planning"),
            FileState::Encoding(i) => write!(f, "encoding({})", i),
            FileState::Finalizing => write!(f, "finalizing"),
            FileState::Done => write!(f, "done"),
            FileState::Failed => write!(f, "failed"),
            FileState::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: FileState,
    pub to: FileState,
}

/// A file the daemon is tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub first_seen: SystemTime,
    /// When the last size/mtime change was observed.
    pub last_size_at: SystemTime,
    pub snapshot: FileSnapshot,
    /// Consecutive polls that saw `snapshot` unchanged, including the first.
    pub matching_polls: u32,
    pub state: FileState,
}

impl WatchedFile {
    pub fn new(path: PathBuf, snapshot: FileSnapshot, now: SystemTime) -> Self {
        Self {
            path,
            first_seen: now,
            last_size_at: now,
            snapshot,
            matching_polls: 1,
            state: FileState::Pending,
        }
    }

    /// Record a poll. Returns true when this poll made the file `Stable`.
    ///
    /// Only `Pending` and `Stable` files are affected; a `Stable` file that
    /// changes again drops back to `Pending`.
    pub fn observe(&mut self, snapshot: FileSnapshot, now: SystemTime, stable_polls: u32) -> bool {
        if !matches!(self.state, FileState::Pending | FileState::Stable) {
            return false;
        }
        match compare_snapshots(self.snapshot, snapshot) {
            StabilityResult::Stable => {
                self.matching_polls = self.matching_polls.saturating_add(1);
            }
            StabilityResult::Unstable { current, .. } => {
                self.snapshot = current;
                self.last_size_at = now;
                self.matching_polls = 1;
                self.state = FileState::Pending;
                return false;
            }
        }
        if self.state == FileState::Pending && self.matching_polls >= stable_polls {
            self.state = FileState::Stable;
            return true;
        }
        false
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: FileState) -> Result<(), TransitionError> {
        if self.state.can_transition_to(next) {
            self.state = next;
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                to: next,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn snap(size: u64) -> FileSnapshot {
        FileSnapshot {
            size,
            mtime: Some(UNIX_EPOCH + Duration::from_secs(size)),
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_two_matching_polls_make_stable() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        assert_eq!(file.state, FileState::Pending);

        assert!(file.observe(snap(10), at(5), 2));
        assert_eq!(file.state, FileState::Stable);
    }

    #[test]
    fn test_growth_resets_debounce() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        assert!(!file.observe(snap(20), at(5), 2));
        assert_eq!(file.matching_polls, 1);
        assert_eq!(file.last_size_at, at(5));
        assert_eq!(file.first_seen, at(0));

        assert!(!file.observe(snap(30), at(10), 2));
        assert!(file.observe(snap(30), at(15), 2));
    }

    #[test]
    fn test_stable_file_that_changes_goes_back_to_pending() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        file.observe(snap(10), at(5), 2);
        assert_eq!(file.state, FileState::Stable);

        assert!(!file.observe(snap(11), at(10), 2));
        assert_eq!(file.state, FileState::Pending);
    }

    #[test]
    fn test_claimed_file_ignores_polls() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        file.observe(snap(10), at(5), 2);
        file.transition(FileState::Claimed).unwrap();

        assert!(!file.observe(snap(99), at(10), 2));
        assert_eq!(file.state, FileState::Claimed);
        assert_eq!(file.snapshot, snap(10));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        for next in [
            FileState::Stable,
            FileState::Claimed,
            FileState::Probing,
            FileState::Planning,
            FileState::Encoding(0),
            FileState::Encoding(1),
            FileState::Finalizing,
            FileState::Done,
        ] {
            file.transition(next).unwrap();
        }
        assert!(file.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut file = WatchedFile::new(PathBuf::from("/w/a.mkv"), snap(10), at(0));
        assert_eq!(
            file.transition(FileState::Claimed),
            Err(TransitionError {
                from: FileState::Pending,
                to: FileState::Claimed
            })
        );

        assert!(!FileState::Planning.can_transition_to(FileState::Encoding(1)));
        assert!(!FileState::Encoding(0).can_transition_to(FileState::Encoding(2)));
        assert!(!FileState::Done.can_transition_to(FileState::Pending));
        assert!(!FileState::Failed.can_transition_to(FileState::Claimed));
        assert!(!FileState::Skipped.can_transition_to(FileState::Stable));
    }

    #[test]
    fn test_in_flight_states() {
        assert!(FileState::Encoding(3).is_in_flight());
        assert!(FileState::Claimed.is_in_flight());
        assert!(!FileState::Stable.is_in_flight());
        assert!(!FileState::Done.is_in_flight());
    }
}
