//! Process-local job store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::{JobRecord, JobStore};

/// In-memory backing: a `HashMap` behind an async `RwLock`. Concurrent puts
/// for the same id serialize on the write lock, so records are replaced
/// whole and never interleaved.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        self.jobs.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }
}
