//! State-machine guard in front of the raw store.
//!
//! Every record mutation flows through here. The tracker refuses state
//! regressions, freezes terminal records, keeps `error` coupled to the
//! Failed state, and treats updates to deleted records as no-ops: a job
//! deleted while its runner is mid-flight must not be resurrected by a late
//! completion.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;

use super::{JobRecord, JobState, JobStore};

#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Register a freshly submitted job.
    pub async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        self.store.put(record).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(id).await
    }

    /// Remove a record, returning it so the caller can tear down its
    /// workspace. `None` if the id is unknown.
    pub async fn remove(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let record = self.store.get(id).await?;
        if record.is_some() {
            self.store.delete(id).await?;
        }
        Ok(record)
    }

    /// Advance to a non-terminal state. Regressions and writes to terminal
    /// or deleted records are ignored.
    pub async fn advance(&self, id: Uuid, next: JobState) {
        self.apply(id, |record| {
            if next.rank() <= record.state.rank() && next != record.state {
                tracing::warn!(
                    job_id = %id,
                    from = %record.state,
                    to = %next,
                    "ignoring state regression"
                );
                return false;
            }
            record.state = next;
            true
        })
        .await;
    }

    /// Mark the tool process as launched.
    pub async fn mark_running(&self, id: Uuid) {
        self.apply(id, |record| {
            if JobState::Running.rank() <= record.state.rank() {
                return false;
            }
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
            true
        })
        .await;
    }

    /// Terminal success. Only valid after packaging verifiably succeeded.
    pub async fn complete(&self, id: Uuid) {
        self.apply(id, |record| {
            record.state = JobState::Complete;
            record.error = None;
            record.finished_at = Some(Utc::now());
            true
        })
        .await;
    }

    /// Terminal failure with a human-readable description.
    pub async fn fail(&self, id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        self.apply(id, |record| {
            record.state = JobState::Failed;
            record.error = Some(reason.clone());
            record.finished_at = Some(Utc::now());
            true
        })
        .await;
    }

    /// Get-modify-put with the invariant checks. Store failures are logged,
    /// not propagated: a flaky store must never crash the runner or leave it
    /// retrying forever.
    async fn apply<F>(&self, id: Uuid, mutate: F)
    where
        F: FnOnce(&mut JobRecord) -> bool,
    {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(job_id = %id, "skipping update for deleted job");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, "job store read failed during update: {e}");
                return;
            }
        };

        if record.state.is_terminal() {
            tracing::warn!(job_id = %id, state = %record.state, "ignoring update to terminal job");
            return;
        }

        let mut updated = record;
        if !mutate(&mut updated) {
            return;
        }
        if let Err(e) = self.store.put(updated).await {
            tracing::warn!(job_id = %id, "job store write failed during update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::store::{MemoryJobStore, test_params};

    fn tracker() -> JobTracker {
        JobTracker::new(Arc::new(MemoryJobStore::new()))
    }

    async fn submitted_job(tracker: &JobTracker) -> Uuid {
        let record = JobRecord::new(Uuid::new_v4(), test_params(), PathBuf::from("/tmp/ws"));
        let id = record.id;
        tracker.insert(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_forward_walk() {
        let t = tracker();
        let id = submitted_job(&t).await;

        t.advance(id, JobState::Extracting).await;
        assert_eq!(t.get(id).await.unwrap().unwrap().state, JobState::Extracting);

        t.mark_running(id).await;
        let record = t.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Running);
        assert!(record.started_at.is_some());

        t.complete(id).await;
        let record = t.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Complete);
        assert!(record.error.is_none());
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_regression_is_ignored() {
        let t = tracker();
        let id = submitted_job(&t).await;
        t.mark_running(id).await;

        t.advance(id, JobState::Extracting).await;
        assert_eq!(t.get(id).await.unwrap().unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_terminal_state_is_frozen() {
        let t = tracker();
        let id = submitted_job(&t).await;
        t.fail(id, "first failure").await;

        t.complete(id).await;
        t.fail(id, "second failure").await;
        t.advance(id, JobState::Running).await;

        let record = t.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error.as_deref(), Some("first failure"));
    }

    #[tokio::test]
    async fn test_failed_always_carries_error() {
        let t = tracker();
        let id = submitted_job(&t).await;
        t.fail(id, "tool exited with code 1").await;

        let record = t.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_update_after_delete_is_noop() {
        let t = tracker();
        let id = submitted_job(&t).await;
        let removed = t.remove(id).await.unwrap();
        assert!(removed.is_some());

        // A late runner update must not resurrect the record.
        t.fail(id, "late failure").await;
        t.complete(id).await;
        assert!(t.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_none() {
        let t = tracker();
        assert!(t.remove(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_running_is_idempotent() {
        let t = tracker();
        let id = submitted_job(&t).await;
        t.mark_running(id).await;
        let first = t.get(id).await.unwrap().unwrap().started_at;

        t.mark_running(id).await;
        let second = t.get(id).await.unwrap().unwrap().started_at;
        assert_eq!(first, second);
    }
}
