//! Scanner module for discovering video files in the watch directory.
//!
//! Used for the startup bulk scan and the periodic rescan that catches
//! events the watcher missed.

use crate::config::WatchConfig;
use crate::finalize::is_temp_output;
use crate::stability::FileSnapshot;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A candidate video file discovered during scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub snapshot: FileSnapshot,
}

/// Decides which paths are worth tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFilter {
    /// Lowercase extensions without the leading dot.
    extensions: Vec<String>,
}

impl MediaFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Checks if a file has a video extension (case-insensitive).
    pub fn is_video_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Video extension, not hidden, and not one of our own temp outputs.
    pub fn accepts(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        !hidden && !is_temp_output(path) && self.is_video_file(path)
    }

    /// True if any component of `path` below `root` is hidden.
    pub fn in_hidden_dir(&self, path: &Path, root: &Path) -> bool {
        let rel = path.strip_prefix(root).unwrap_or(path);
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));
        parent
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    }
}

impl From<&WatchConfig> for MediaFilter {
    fn from(watch: &WatchConfig) -> Self {
        Self::new(&watch.extensions)
    }
}

/// Scans `root` for video files.
///
/// Hidden directories are never entered; with `recursive` false only the
/// top level is listed.
pub fn scan_directory(root: &Path, recursive: bool, filter: &MediaFilter) -> Vec<ScanCandidate> {
    if !root.exists() {
        return Vec::new();
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            // Allow the root directory even if it starts with '.'
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false))
        });

    let mut candidates = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !filter.accepts(entry.path()) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            candidates.push(ScanCandidate {
                path: entry.path().to_path_buf(),
                snapshot: FileSnapshot {
                    size: metadata.len(),
                    mtime: metadata.modified().ok(),
                },
            });
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn default_filter() -> MediaFilter {
        MediaFilter::from(&WatchConfig::default())
    }

    #[test]
    fn test_is_video_file() {
        let filter = default_filter();
        assert!(filter.is_video_file(Path::new("/media/movie.mkv")));
        assert!(filter.is_video_file(Path::new("/media/movie.MKV")));
        assert!(filter.is_video_file(Path::new("/media/movie.webm")));
        assert!(filter.is_video_file(Path::new("/media/movie.m2ts")));
        assert!(!filter.is_video_file(Path::new("/media/movie.srt")));
        assert!(!filter.is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_extensions_normalized() {
        let filter = MediaFilter::new([".MKV", "", "mp4"]);
        assert!(filter.is_video_file(Path::new("a.mkv")));
        assert!(filter.is_video_file(Path::new("a.MP4")));
        assert!(!filter.is_video_file(Path::new("a.avi")));
    }

    #[test]
    fn test_accepts_rejects_hidden_and_partial() {
        let filter = default_filter();
        assert!(filter.accepts(Path::new("/w/Movie - 4k.mkv")));
        assert!(!filter.accepts(Path::new("/w/.Movie.mkv")));
        assert!(!filter.accepts(Path::new(
            "/w/.Movie - 1080p.0b9f8a5e-2c1d-4e3f-8a7b-6c5d4e3f2a1b.partial.mkv"
        )));
    }

    #[test]
    fn test_in_hidden_dir() {
        let filter = default_filter();
        let root = Path::new("/w");
        assert!(filter.in_hidden_dir(Path::new("/w/.trash/a.mkv"), root));
        assert!(!filter.in_hidden_dir(Path::new("/w/show/a.mkv"), root));
    }

    #[test]
    fn test_non_recursive_scan() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("top.mkv")).unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        File::create(root.join("sub").join("nested.mkv")).unwrap();

        let flat = scan_directory(root, false, &default_filter());
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].path, root.join("top.mkv"));

        let deep = scan_directory(root, true, &default_filter());
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn test_scan_missing_root() {
        assert!(scan_directory(Path::new("/nonexistent/uhd"), true, &default_filter()).is_empty());
    }

    #[test]
    fn test_scan_records_size() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.mp4"), b"12345").unwrap();
        let found = scan_directory(temp_dir.path(), true, &default_filter());
        assert_eq!(found[0].snapshot.size, 5);
        assert!(found[0].snapshot.mtime.is_some());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_hidden_directory_exclusion(
            visible_dir in "[a-zA-Z0-9]{1,10}",
            hidden_dir in "\\.[a-zA-Z0-9]{1,10}",
            filename in "[a-zA-Z0-9]{1,10}",
        ) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();

            let visible_path = root.join(&visible_dir);
            fs::create_dir_all(&visible_path).unwrap();
            let visible_video = visible_path.join(format!("{}.mkv", filename));
            File::create(&visible_video).unwrap();

            let hidden_path = root.join(&hidden_dir);
            fs::create_dir_all(&hidden_path).unwrap();
            let hidden_video = hidden_path.join(format!("{}.mkv", filename));
            File::create(&hidden_video).unwrap();

            let candidates = scan_directory(root, true, &default_filter());

            prop_assert!(
                candidates.iter().any(|c| c.path == visible_video),
                "Video in visible directory should be found: {:?}",
                visible_video
            );
            prop_assert!(
                !candidates.iter().any(|c| c.path == hidden_video),
                "Video in hidden directory should NOT be found: {:?}",
                hidden_video
            );
        }
    }
}
