//! Filesystem watcher feeding candidate paths to the ingest loop.

use crate::scan::MediaFilter;
use notify::event::{AccessKind, AccessMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create file watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Whether an event can mean "a file appeared or finished being written".
pub fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        _ => false,
    }
}

/// Paths from `event` that pass `filter` and are not inside hidden dirs.
pub fn event_paths(event: Event, root: &Path, filter: &MediaFilter) -> Vec<PathBuf> {
    if !is_relevant(&event.kind) {
        return Vec::new();
    }
    event
        .paths
        .into_iter()
        .filter(|p| filter.accepts(p) && !filter.in_hidden_dir(p, root))
        .collect()
}

/// Keeps the underlying notify watcher alive; dropping it stops events.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Watch `root` and forward matching paths to `tx`.
    ///
    /// The notify callback runs on its own thread, so it uses
    /// `blocking_send`; a closed channel just drops the event.
    pub fn start(
        root: &Path,
        recursive: bool,
        filter: MediaFilter,
        tx: mpsc::Sender<PathBuf>,
    ) -> Result<Self, WatchError> {
        let root_owned = root.to_path_buf();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for path in event_paths(event, &root_owned, &filter) {
                        tracing::debug!(path = %path.display(), "file event");
                        let _ = tx.blocking_send(path);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            NotifyConfig::default(),
        )
        .map_err(WatchError::Create)?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode).map_err(|source| WatchError::Watch {
            path: root.to_path_buf(),
            source,
        })?;
        tracing::info!(dir = %root.display(), recursive, "watching directory");

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::time::Duration;

    fn filter() -> MediaFilter {
        MediaFilter::new(["mkv", "mp4"])
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_relevant_kinds() {
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_relevant(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
        assert!(!is_relevant(&EventKind::Access(AccessKind::Close(AccessMode::Read))));
        assert!(!is_relevant(&EventKind::Remove(RemoveKind::File)));
    }

    #[test]
    fn test_event_paths_filtering() {
        let root = Path::new("/w");
        let create = EventKind::Create(CreateKind::File);

        assert_eq!(
            event_paths(event(create, "/w/a.mkv"), root, &filter()),
            vec![PathBuf::from("/w/a.mkv")]
        );
        assert!(event_paths(event(create, "/w/a.nfo"), root, &filter()).is_empty());
        assert!(event_paths(event(create, "/w/.a.mkv"), root, &filter()).is_empty());
        assert!(event_paths(event(create, "/w/.tmp/a.mkv"), root, &filter()).is_empty());
        assert!(event_paths(event(EventKind::Remove(RemoveKind::File), "/w/a.mkv"), root, &filter()).is_empty());
    }

    #[test]
    fn test_watch_missing_dir_errors() {
        let (tx, _rx) = mpsc::channel(4);
        let result = FileWatcher::start(Path::new("/nonexistent/uhd-scaler"), true, filter(), tx);
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _watcher = FileWatcher::start(dir.path(), true, filter(), tx).unwrap();

        let path = dir.path().join("arrival.mkv");
        std::fs::write(&path, b"data").unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .expect("channel closed");
        assert_eq!(got.file_name(), path.file_name());
    }
}
