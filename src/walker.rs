/*
Deterministic traversal of a directory tree, yielding regular files only.
Entries are sorted by file name, which makes the stream lexicographic on
the null-joined encoded path, so replaying a walk is idempotent. Errors on
individual entries are logged and skipped; one bad entry never aborts a
walk.
*/

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::report::REPORT_SUFFIX;
use crate::repository::INDEX_DIR;

#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub abs: PathBuf,
    pub rel: PathBuf,
}

fn skipped(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    // The index directory is only special at the walk root; report
    // directories are never walked into.
    (entry.depth() == 1 && name == INDEX_DIR) || name.ends_with(REPORT_SUFFIX)
}

/// Walk `root`, yielding regular files in encoded-path order. Symlinks are
/// never followed.
pub fn walk(root: &Path) -> impl Iterator<Item = WalkedFile> {
    let root = root.to_path_buf();
    WalkDir::new(root.clone())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !skipped(entry))
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => {
                let rel = entry.path().strip_prefix(&root).ok()?.to_path_buf();
                Some(WalkedFile {
                    abs: entry.into_path(),
                    rel,
                })
            }
            Ok(_) => None,
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                None
            }
        })
}
