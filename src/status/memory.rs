use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StatusStore, StatusStoreError};
use crate::state_machine::JobStatus;

/// Process-local status store, for single-shot CLI runs without Redis.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    entries: RwLock<HashMap<String, JobStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn set(&self, job_id: &str, status: JobStatus) -> Result<(), StatusStoreError> {
        self.entries.write().await.insert(job_id.to_string(), status);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>, StatusStoreError> {
        Ok(self.entries.read().await.get(job_id).copied())
    }

    async fn delete(&self, job_id: &str) -> Result<(), StatusStoreError> {
        self.entries.write().await.remove(job_id);
        Ok(())
    }
}
