//! Path helpers and directory walking for library scans.

use std::path::{Component, Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

/// Turn `path` into the absolute form used as an item key.
///
/// Existing paths are canonicalized (symlinks resolved). Paths that do not
/// exist, like the old side of a rename, are made absolute and cleaned up
/// lexically instead.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| clean_path(path))
}

/// Make `path` absolute and drop `.`/`..` components without touching the
/// filesystem, so symlinks along the way are kept as they are.
pub fn clean_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }
    clean
}

/// Dot-files and dot-directories.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name != "." && name != "..")
}

/// Whether `path` is `root` or lies below it. Compares whole components.
pub fn is_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

pub(crate) fn is_excluded(path: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|prefix| is_under(path, prefix))
}

/// Walk `root` and yield every regular file below it.
///
/// - Directory symlinks below the root are not followed; file symlinks are
///   resolved and their target is yielded.
/// - Hidden files and directories are skipped when `skip_hidden` is set.
/// - Anything under an `exclude` prefix is skipped, checked both before and
///   after resolving symlinks.
///
/// The walk is lazy so callers can interleave it with other work.
pub fn iter_paths(
    root: &Path,
    exclude: &[PathBuf],
    skip_hidden: bool,
) -> Box<dyn Iterator<Item = PathBuf>> {
    let root = normalize_path(root);
    let exclude: Vec<PathBuf> = exclude.iter().map(|p| normalize_path(p)).collect();

    if is_excluded(&root, &exclude) {
        return Box::new(std::iter::empty());
    }
    if root.is_file() {
        return Box::new(std::iter::once(root));
    }

    let filter_exclude = exclude.clone();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| keep_entry(entry, &filter_exclude, skip_hidden));

    Box::new(walker.filter_map(move |entry| {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(target: "library::file", error = %e, "Skipping unreadable entry");
                return None;
            }
        };
        if entry.file_type().is_dir() {
            return None;
        }
        let resolved = entry.path().canonicalize().ok()?;
        (resolved.is_file() && !is_excluded(&resolved, &exclude)).then_some(resolved)
    }))
}

fn keep_entry(entry: &DirEntry, exclude: &[PathBuf], skip_hidden: bool) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if skip_hidden && is_hidden(entry.path()) {
        return false;
    }
    !is_excluded(entry.path(), exclude)
}
