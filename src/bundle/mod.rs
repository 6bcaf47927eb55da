//! Bundle intake: per-job workspaces and upload validation.
//!
//! A workspace is a directory tree owned by exactly one job:
//!
//! ```text
//! {root}/{job_id}/
//!   input.zip      raw upload
//!   extracted/     decompressed tree (untrusted structure)
//!   output/        tool output target
//!   output/run.log captured stdout+stderr with the invocation recorded
//!   result.zip     packaged deliverable (success only)
//! ```

pub mod locator;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ValidationError;

pub use self::locator::locate_marker_root;

/// Path layout for one job's on-disk tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace directory for a job.
    pub async fn create(base: &Path, id: Uuid) -> std::io::Result<Self> {
        let root = base.join(id.to_string());
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Wrap an existing workspace path (from a stored record).
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_zip(&self) -> PathBuf {
        self.root.join("input.zip")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn run_log(&self) -> PathBuf {
        self.output_dir().join("run.log")
    }

    pub fn result_zip(&self) -> PathBuf {
        self.root.join("result.zip")
    }

    /// Remove the whole tree. Missing directories are fine.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Validate the materialized upload, decompress it, and locate the dataset
/// root. Returns the marker root on success.
///
/// The three rejections (empty upload, invalid archive, no marker root) each
/// produce a distinct [`ValidationError`]; the caller surfaces the message
/// to the submitter and marks the job Failed.
pub async fn unpack_and_locate(
    workspace: &Workspace,
    marker: &str,
) -> Result<PathBuf, ValidationError> {
    let input = workspace.input_zip();
    let meta = tokio::fs::metadata(&input)
        .await
        .map_err(|e| ValidationError::InvalidArchive {
            reason: format!("upload not readable: {e}"),
        })?;
    if meta.len() == 0 {
        return Err(ValidationError::EmptyUpload);
    }

    let extracted = workspace.extracted_dir();
    extract_zip(&input, &extracted).await?;

    let marker = marker.to_string();
    match locate_marker_root(&extracted, &marker) {
        Some(root) => Ok(root),
        None => Err(ValidationError::MarkerNotFound {
            marker,
            listing: top_level_listing(&extracted).await,
        }),
    }
}

/// Decompress `archive` into `dest`. Zip work is blocking, so it runs on the
/// blocking pool.
async fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ValidationError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive).map_err(|e| ValidationError::InvalidArchive {
            reason: e.to_string(),
        })?;
        let mut zip =
            zip::ZipArchive::new(file).map_err(|e| ValidationError::InvalidArchive {
                reason: e.to_string(),
            })?;
        zip.extract(&dest).map_err(|e| ValidationError::InvalidArchive {
            reason: e.to_string(),
        })
    })
    .await
    .map_err(|e| ValidationError::InvalidArchive {
        reason: format!("extraction task failed: {e}"),
    })?
}

/// One-line dump of the top level of the extracted tree, for the
/// marker-not-found diagnostic. Directories get a trailing slash.
async fn top_level_listing(dir: &Path) -> String {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return "<unreadable>".to_string(),
    };

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    if names.is_empty() {
        "<empty>".to_string()
    } else {
        names.join(", ")
    }
}
