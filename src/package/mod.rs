//! Result packaging and the delivery-size strategy.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;

use crate::error::PackagingError;

/// Archives at or under this size are served as a whole file; larger ones
/// are streamed chunk-by-chunk to bound peak memory during transfer.
pub const STREAM_THRESHOLD_BYTES: u64 = 150 * 1024 * 1024;

/// How a result archive should be sent to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Whole,
    Streamed,
}

pub fn delivery_for(archive_bytes: u64) -> Delivery {
    if archive_bytes <= STREAM_THRESHOLD_BYTES {
        Delivery::Whole
    } else {
        Delivery::Streamed
    }
}

/// Package the tool's output tree (run log included) into `dest`, replacing
/// any stale archive from an earlier attempt. Returns the archive size in
/// bytes.
pub async fn archive_output(output_dir: &Path, dest: &Path) -> Result<u64, PackagingError> {
    let output_dir = output_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || archive_dir(&output_dir, &dest))
        .await
        .map_err(|e| PackagingError::Archive {
            reason: format!("packaging task failed: {e}"),
        })?
}

fn archive_dir(src: &Path, dest: &Path) -> Result<u64, PackagingError> {
    let archive_err = |reason: String| PackagingError::Archive { reason };

    if dest.exists() {
        std::fs::remove_file(dest).map_err(|e| archive_err(format!("cannot replace stale archive: {e}")))?;
    }

    let file =
        std::fs::File::create(dest).map_err(|e| archive_err(format!("cannot create archive: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let mut entries = 0usize;
    let mut buf = Vec::new();
    for path in walk_files(src).map_err(|e| archive_err(e.to_string()))? {
        let rel = path
            .strip_prefix(src)
            .map_err(|e| archive_err(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");

        writer
            .start_file(rel, options)
            .map_err(|e| archive_err(e.to_string()))?;
        let mut f =
            std::fs::File::open(&path).map_err(|e| archive_err(format!("cannot read {}: {e}", path.display())))?;
        buf.clear();
        f.read_to_end(&mut buf)
            .map_err(|e| archive_err(format!("cannot read {}: {e}", path.display())))?;
        writer
            .write_all(&buf)
            .map_err(|e| archive_err(e.to_string()))?;
        entries += 1;
    }

    if entries == 0 {
        let _ = std::fs::remove_file(dest);
        return Err(PackagingError::EmptyArchive);
    }

    writer
        .finish()
        .map_err(|e| archive_err(e.to_string()))?;

    let meta =
        std::fs::metadata(dest).map_err(|e| archive_err(format!("cannot stat archive: {e}")))?;
    Ok(meta.len())
}

/// All regular files under `root`, depth-first, sorted within each directory
/// so archive layout is stable across runs.
fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let ft = entry.file_type()?;
            if ft.is_dir() {
                dirs.push(entry.path());
            } else if ft.is_file() {
                files.push(entry.path());
            }
        }
    }

    Ok(files)
}
