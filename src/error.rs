use std::any::Any;

use thiserror::Error;

use crate::carrier::CarrierError;
use crate::status::StatusStoreError;
use crate::storage::{StorageError, UploadError};

#[derive(Debug, Error)]
pub enum BillfetchError {
    #[error("Invalid job request: {0}")]
    Carrier(#[from] CarrierError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Status store error: {0}")]
    Status(#[from] StatusStoreError),

    #[error("Job {0} ended without a report: {1}")]
    Join(String, #[source] tokio::task::JoinError),
}

/// Human-readable text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
