//! Output naming and finalization.
//!
//! Encodes are written to a hidden temp file next to the final output and
//! renamed into place only after success, so the final name never refers to
//! a partial file.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker inside temp output names.
const PARTIAL_MARKER: &str = ".partial.";

/// Errors that can occur after a successful encode.
///
/// Both the original and the encoded output are left on disk.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move {from} into place at {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output written to {output} but original {original} could not be deleted: {source}")]
    DeleteOriginal {
        original: PathBuf,
        output: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What to do with a finished encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOptions {
    pub delete_original: bool,
    /// Empty parents of a deleted original are pruned up to this root.
    pub watch_root: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Drop the last ` - <tag>` segment (no parentheses in the tag) from a base name.
///
/// `Movie (2020) - 2160p` becomes `Movie (2020)`, `Show - S01E01 - 2160p`
/// becomes `Show - S01E01`, and `Movie - Part (1)` is kept.
pub fn strip_tag(base: &str) -> &str {
    match base.rfind(" - ") {
        Some(at) => {
            let tag = &base[at + 3..];
            if tag.is_empty() || tag.contains(['(', ')']) {
                base
            } else {
                &base[..at]
            }
        }
        None => base,
    }
}

/// Final output path for `input`.
///
/// `<output root>/<relative dir>/<base><suffix><ext>`, where the output root
/// defaults to the watch root and the relative dir is `input`'s directory
/// relative to `watch_root`.
pub fn output_path_for(
    input: &Path,
    watch_root: &Path,
    output_root: Option<&Path>,
    suffix: &str,
) -> PathBuf {
    let parent = input.parent().unwrap_or_else(|| Path::new(""));
    let dir = match output_root {
        Some(root) => match parent.strip_prefix(watch_root) {
            Ok(rel) => root.join(rel),
            Err(_) => root.to_path_buf(),
        },
        None => parent.to_path_buf(),
    };

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{}{}", strip_tag(&stem), suffix);
    if let Some(ext) = input.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    dir.join(name)
}

/// Hidden temp path beside `final_path`, keeping its extension so the muxer
/// can be inferred.
pub fn temp_output_path(final_path: &Path) -> PathBuf {
    let stem = final_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = final_path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mkv".to_string());
    let name = format!(".{}.{}{}{}", stem, uuid::Uuid::new_v4(), PARTIAL_MARKER, ext);
    final_path.with_file_name(name)
}

/// True for names produced by [`temp_output_path`].
pub fn is_temp_output(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .map(|n| n.starts_with('.') && n.contains(PARTIAL_MARKER))
        .unwrap_or(false)
}

/// Create the directory that will hold `final_path`.
pub fn ensure_output_dir(final_path: &Path) -> Result<(), FinalizeError> {
    match final_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|source| FinalizeError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn apply_permissions(path: &Path, opts: &FinalizeOptions) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        tracing::warn!(path = %path.display(), error = %e, "failed to set output permissions");
    }
    if opts.uid.is_some() || opts.gid.is_some() {
        if let Err(e) = std::os::unix::fs::chown(path, opts.uid, opts.gid) {
            tracing::warn!(path = %path.display(), error = %e, "failed to set output owner");
        }
    }
}

#[cfg(not(unix))]
fn apply_permissions(_path: &Path, _opts: &FinalizeOptions) {}

/// Remove empty directories from `start` upwards, stopping at `root`.
pub fn remove_empty_parents(start: &Path, root: &Path) {
    let mut dir = start;
    while dir != root && dir.starts_with(root) {
        let empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty || fs::remove_dir(dir).is_err() {
            break;
        }
        tracing::debug!(dir = %dir.display(), "removed empty directory");
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}

/// Move `temp` into place at `final_path` and dispose of `original`.
///
/// Returns the size of the finished output. The original is only touched
/// after the rename succeeded, and never when it is the output itself.
pub fn finalize(
    temp: &Path,
    final_path: &Path,
    original: &Path,
    opts: &FinalizeOptions,
) -> Result<u64, FinalizeError> {
    fs::rename(temp, final_path).map_err(|source| FinalizeError::Rename {
        from: temp.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    })?;
    apply_permissions(final_path, opts);
    let size = fs::metadata(final_path).map(|m| m.len()).unwrap_or(0);

    if opts.delete_original && original != final_path {
        fs::remove_file(original).map_err(|source| FinalizeError::DeleteOriginal {
            original: original.to_path_buf(),
            output: final_path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %original.display(), "deleted original");
        if let Some(parent) = original.parent() {
            remove_empty_parents(parent, &opts.watch_root);
        }
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts(root: &Path, delete_original: bool) -> FinalizeOptions {
        FinalizeOptions {
            delete_original,
            watch_root: root.to_path_buf(),
            uid: None,
            gid: None,
        }
    }

    #[test]
    fn test_strip_tag() {
        assert_eq!(strip_tag("Movie - 4k"), "Movie");
        assert_eq!(strip_tag("Movie (2020) - 2160p"), "Movie (2020)");
        assert_eq!(strip_tag("Movie - Part (1)"), "Movie - Part (1)");
        assert_eq!(strip_tag("Show - S01E01 - 2160p"), "Show - S01E01");
        assert_eq!(strip_tag("Show - S01E02 - 2160p"), "Show - S01E02");
        assert_eq!(strip_tag("Show - S01E01"), "Show");
        assert_eq!(strip_tag("Plain"), "Plain");
        assert_eq!(strip_tag("Trailing - "), "Trailing - ");
    }

    #[test]
    fn test_output_path_in_place() {
        let out = output_path_for(
            Path::new("/watch_dir/movies/Movie (2020) - 4k.mkv"),
            Path::new("/watch_dir"),
            None,
            " - 1080p",
        );
        assert_eq!(out, PathBuf::from("/watch_dir/movies/Movie (2020) - 1080p.mkv"));
    }

    #[test]
    fn test_output_path_mirrors_relative_dir() {
        let out = output_path_for(
            Path::new("/watch_dir/shows/Show/S01/ep1.mp4"),
            Path::new("/watch_dir"),
            Some(Path::new("/media/1080p")),
            " - 1080p",
        );
        assert_eq!(out, PathBuf::from("/media/1080p/shows/Show/S01/ep1 - 1080p.mp4"));
    }

    #[test]
    fn test_temp_output_is_hidden_sibling() {
        let final_path = Path::new("/out/Movie - 1080p.mkv");
        let temp = temp_output_path(final_path);

        assert_eq!(temp.parent(), final_path.parent());
        assert!(is_temp_output(&temp));
        assert_eq!(temp.extension().unwrap(), "mkv");
        assert_ne!(temp, temp_output_path(final_path));
        assert!(!is_temp_output(final_path));
        assert!(!is_temp_output(Path::new("/out/.hidden.mkv")));
    }

    #[test]
    fn test_finalize_moves_output_and_deletes_original() {
        let root = TempDir::new().unwrap();
        let season = root.path().join("Show").join("S01");
        fs::create_dir_all(&season).unwrap();
        let original = season.join("ep1 - 4k.mkv");
        fs::write(&original, b"uhd").unwrap();

        let out_root = TempDir::new().unwrap();
        let final_path = output_path_for(&original, root.path(), Some(out_root.path()), " - 1080p");
        ensure_output_dir(&final_path).unwrap();
        let temp = temp_output_path(&final_path);
        fs::write(&temp, b"encoded").unwrap();

        let size = finalize(&temp, &final_path, &original, &opts(root.path(), true)).unwrap();

        assert_eq!(size, 7);
        assert_eq!(fs::read(&final_path).unwrap(), b"encoded");
        assert!(!temp.exists());
        assert!(!original.exists());
        // Empty Show/S01 pruned, root kept.
        assert!(!root.path().join("Show").exists());
        assert!(root.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_finalize_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.mkv");
        fs::write(&original, b"uhd").unwrap();
        let final_path = dir.path().join("a - 1080p.mkv");
        let temp = temp_output_path(&final_path);
        fs::write(&temp, b"encoded").unwrap();
        fs::set_permissions(&temp, fs::Permissions::from_mode(0o600)).unwrap();

        finalize(&temp, &final_path, &original, &opts(dir.path(), false)).unwrap();

        let mode = fs::metadata(&final_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert!(original.exists());
    }

    #[test]
    fn test_finalize_never_deletes_output_that_replaced_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.mkv");
        fs::write(&original, b"uhd").unwrap();
        let temp = temp_output_path(&original);
        fs::write(&temp, b"encoded").unwrap();

        finalize(&temp, &original, &original, &opts(dir.path(), true)).unwrap();

        assert_eq!(fs::read(&original).unwrap(), b"encoded");
    }

    #[test]
    fn test_rename_failure_keeps_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.mkv");
        fs::write(&original, b"uhd").unwrap();
        let missing_temp = dir.path().join(".a.partial.mkv");

        let result = finalize(
            &missing_temp,
            &dir.path().join("a - 1080p.mkv"),
            &original,
            &opts(dir.path(), true),
        );

        assert!(matches!(result, Err(FinalizeError::Rename { .. })));
        assert!(original.exists());
    }

    #[test]
    fn test_remove_empty_parents_stops_at_non_empty() {
        let root = TempDir::new().unwrap();
        let deep = root.path().join("a").join("b").join("c");
        fs::create_dir_all(&deep).unwrap();
        fs::write(root.path().join("a").join("keep.txt"), b"x").unwrap();

        remove_empty_parents(&deep, root.path());

        assert!(!root.path().join("a").join("b").exists());
        assert!(root.path().join("a").exists());
    }
}
