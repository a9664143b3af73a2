use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Closed classification of object storage failures, decided where the
/// failure is observed. Retry policy is derived from it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    Timeout,
    Throttling,
    Auth,
    Validation,
    Other,
}

impl StorageErrorKind {
    /// Only timeouts and throttling are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageErrorKind::Timeout | StorageErrorKind::Throttling)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// One uploaded chunk of a multi-part transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    /// 1-based, in file order.
    pub part_number: i32,
    pub etag: String,
}

/// Durable object storage addressed by key within one bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError>;

    /// Open a multi-part transfer and return its upload id.
    async fn create_multipart(&self, key: &str) -> Result<String, StorageError>;

    /// Upload one chunk and return its entity tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StorageError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedChunk],
    ) -> Result<(), StorageError>;

    /// Discard a multi-part transfer and any chunks already stored.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    /// Human-readable location of an object, for reports.
    fn location(&self, key: &str) -> String;
}
