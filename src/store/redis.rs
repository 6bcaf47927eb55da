//! Shared job store backed by Redis.
//!
//! Records are stored as flat JSON strings under `scanforge:job:{id}`, so
//! several service replicas can see the same jobs and terminal records
//! survive a process restart. In-flight jobs lost in a crash are an accepted
//! limitation; nothing here tries to resume them.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::StoreError;

use super::{JobRecord, JobStore};

pub struct RedisJobStore {
    conn: ConnectionManager,
}

fn job_key(id: Uuid) -> String {
    format!("scanforge:job:{id}")
}

impl RedisJobStore {
    /// Connect and verify the server responds to PING. A dead server here
    /// makes the caller fall back to the in-memory store.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend {
            reason: format!("invalid redis url: {e}"),
        })?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend {
                reason: format!("connect failed: {e}"),
            })?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend {
                reason: format!("ping failed: {e}"),
            })?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record).map_err(|e| StoreError::Serialize {
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(job_key(record.id), payload)
            .await
            .map_err(|e| StoreError::Backend {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(job_key(id)).await.map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        match raw {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|e| StoreError::Serialize {
                    reason: e.to_string(),
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(job_key(id)).await.map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            job_key(id),
            "scanforge:job:00000000-0000-0000-0000-000000000000"
        );
    }
}
