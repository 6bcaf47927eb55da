//! Job records and the store they live in.
//!
//! A job walks Submitted → Extracting → Running → {Complete | Failed} and
//! never moves again once terminal. Records are kept in a [`JobStore`], an
//! in-process map by default, or Redis when configured, so terminal jobs
//! survive a restart when several replicas share one server. All mutation
//! goes through [`JobTracker`], which enforces the state-machine invariants
//! and swallows updates for records that were deleted mid-flight.

mod memory;
mod redis;
mod tracker;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;
pub use self::tracker::JobTracker;

/// Lifecycle state of a job. Monotonic; Complete and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Extracting,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Position in the lifecycle, used to refuse regressions.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Extracting => 1,
            Self::Running => 2,
            Self::Complete | Self::Failed => 3,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Extracting => "extracting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Submission parameters, captured once at intake and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub participant_label: String,
    pub modalities: Vec<String>,
    /// Passed through to the tool verbatim (case preserved).
    pub session_id: Option<String>,
    pub nprocs: u32,
    pub mem_gb: u32,
    /// Per-job override of the configured wall-clock timeout.
    pub timeout_secs: Option<u64>,
}

/// One submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub state: JobState,
    pub params: JobParams,
    /// Filesystem tree exclusively owned by this job.
    pub workspace: PathBuf,
    /// Set only when state is Failed; never cleared afterwards.
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid, params: JobParams, workspace: PathBuf) -> Self {
        Self {
            id,
            state: JobState::Submitted,
            params,
            workspace,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Mapping from job id to record. Whole records are replaced on `put`, so a
/// reader never observes a half-updated record.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, record: JobRecord) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Connect the configured store backing.
///
/// An unreachable Redis is a degradation, not a startup failure: the service
/// logs a warning and continues on the in-memory store.
pub async fn connect(config: &StoreConfig) -> std::sync::Arc<dyn JobStore> {
    if let Some(ref url) = config.redis_url {
        match RedisJobStore::connect(url).await {
            Ok(store) => {
                tracing::info!("connected to shared job store at {url}");
                return std::sync::Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("cannot reach shared job store ({e}); using in-memory store");
            }
        }
    }
    std::sync::Arc::new(MemoryJobStore::new())
}

#[cfg(test)]
pub(crate) fn test_params() -> JobParams {
    JobParams {
        participant_label: "01".to_string(),
        modalities: vec!["T1w".to_string(), "bold".to_string()],
        session_id: None,
        nprocs: 4,
        mem_gb: 16,
        timeout_secs: None,
    }
}
