//! Job status persistence: a key-value surface keyed by job id.

mod memory;
mod redis;

use async_trait::async_trait;
use thiserror::Error;

use crate::state_machine::JobStatus;

pub use self::memory::MemoryStatusStore;
pub use self::redis::RedisStatusStore;

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("could not reach the status store after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        source: ::redis::RedisError,
    },

    #[error("status store command failed: {0}")]
    Command(#[from] ::redis::RedisError),

    #[error("unrecognised status {value:?} stored for job {job_id}")]
    Corrupt { job_id: String, value: String },
}

/// Latest-value store for job statuses. Each key has a single writer, the
/// job that owns it, so no locking protocol is needed across jobs.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set(&self, job_id: &str, status: JobStatus) -> Result<(), StatusStoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>, StatusStoreError>;

    async fn delete(&self, job_id: &str) -> Result<(), StatusStoreError>;
}

fn parse_status(job_id: &str, value: String) -> Result<JobStatus, StatusStoreError> {
    value.parse().map_err(|_| StatusStoreError::Corrupt {
        job_id: job_id.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_values_parse_back() {
        assert_eq!(parse_status("j", "processing".into()).unwrap(), JobStatus::Processing);
        let err = parse_status("j", "done-ish".into()).unwrap_err();
        assert!(matches!(err, StatusStoreError::Corrupt { ref value, .. } if value == "done-ish"));
    }
}
