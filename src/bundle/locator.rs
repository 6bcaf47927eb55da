//! Marker-based dataset root discovery.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Find the shallowest directory under `root` (inclusive) that directly
/// contains a file named `marker`.
///
/// Breadth-first, so a match at depth 1 always beats one at depth 3; ties on
/// the same level fall to directory-listing order. Dot-prefixed entries are
/// not descended into (archives routinely ship `.DS_Store`, `__MACOSX` is
/// not dot-prefixed but harmless, editor metadata, etc.), and unreadable
/// directories are skipped rather than aborting the search: a subtree we
/// cannot list simply contributes no match.
///
/// `None` means the uploaded bundle has no recognizable root; callers treat
/// that as a validation failure, not a fault.
pub fn locate_marker_root(root: &Path, marker: &str) -> Option<PathBuf> {
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        if dir.join(marker).is_file() {
            return Some(dir);
        }

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("skipping unreadable directory {}: {e}", dir.display());
                continue;
            }
        };

        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => queue.push_back(entry.path()),
                _ => {}
            }
        }
    }

    None
}
