//! Promoting a directory of local artifacts into object storage.
//!
//! Files up to the chunk size go up in one request. Larger files are sent as
//! a multi-part transfer of fixed-size chunks, uploaded in order. A chunk
//! that runs out of retries aborts the whole transfer so nothing partial is
//! left on the server. One failed file never stops the rest of the batch.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::store::{CompletedChunk, ObjectStore, StorageError};
use crate::config::StorageConfig;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    SingleShot,
    Chunked { chunks: u64 },
}

impl TransferMode {
    /// Sizes up to and including `chunk_size` go single-shot.
    pub fn for_size(size: u64, chunk_size: u64) -> Self {
        if size <= chunk_size {
            TransferMode::SingleShot
        } else {
            TransferMode::Chunked {
                chunks: size.div_ceil(chunk_size),
            }
        }
    }
}

/// `YYYY/MM/DD/<file name>`.
pub fn destination_key(date: NaiveDate, file_name: &str) -> String {
    format!("{}/{file_name}", date.format("%Y/%m/%d"))
}

/// How one local file will be transferred, and where to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    pub path: PathBuf,
    pub key: String,
    pub size: u64,
    pub mode: TransferMode,
}

impl UploadPlan {
    /// `None` if the path has no usable file name.
    pub fn new(path: &Path, size: u64, date: NaiveDate, chunk_size: u64) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Some(Self {
            path: path.to_path_buf(),
            key: destination_key(date, name),
            size,
            mode: TransferMode::for_size(size, chunk_size),
        })
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("upload of {key} failed: {source}")]
    Storage { key: String, source: StorageError },

    /// A chunk ran out of retries and the multi-part transfer was aborted.
    #[error("chunked upload of {key} aborted at part {part_number}: {source}")]
    ChunkedUploadAbort {
        key: String,
        part_number: i32,
        source: StorageError,
    },
}

pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    chunk_size: u64,
    retry: RetryPolicy,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size_bytes.max(1),
            retry: RetryPolicy::new(
                config.max_attempts,
                Backoff::Linear(Duration::from_millis(config.retry_delay_ms)),
            ),
        }
    }

    /// Where an uploaded key can be found.
    pub fn location(&self, key: &str) -> String {
        self.store.location(key)
    }

    /// Upload every regular file directly inside `dir` under today's (UTC)
    /// date prefix. Returns the keys that made it.
    pub async fn upload_directory(&self, dir: &Path) -> Result<Vec<String>, UploadError> {
        self.upload_directory_on(dir, Utc::now().date_naive()).await
    }

    pub async fn upload_directory_on(&self, dir: &Path, date: NaiveDate) -> Result<Vec<String>, UploadError> {
        let files = list_files(dir).await.map_err(|source| UploadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if files.is_empty() {
            info!(dir = %dir.display(), "nothing to upload");
            return Ok(Vec::new());
        }

        let mut uploaded = Vec::with_capacity(files.len());
        for (path, size) in files {
            if size == 0 {
                warn!(file = %path.display(), "skipping empty file");
                continue;
            }
            let Some(plan) = UploadPlan::new(&path, size, date, self.chunk_size) else {
                warn!(file = %path.display(), "skipping file without a usable name");
                continue;
            };
            match self.upload(&plan).await {
                Ok(()) => {
                    info!(key = %plan.key, size = plan.size, mode = ?plan.mode, "uploaded");
                    uploaded.push(plan.key);
                }
                Err(err) => warn!(key = %plan.key, error = %err, "upload failed, continuing with next file"),
            }
        }
        Ok(uploaded)
    }

    pub async fn upload(&self, plan: &UploadPlan) -> Result<(), UploadError> {
        match plan.mode {
            TransferMode::SingleShot => self.upload_single(plan).await,
            TransferMode::Chunked { .. } => self.upload_chunked(plan).await,
        }
    }

    async fn upload_single(&self, plan: &UploadPlan) -> Result<(), UploadError> {
        let body = Bytes::from(tokio::fs::read(&plan.path).await.map_err(|source| UploadError::Io {
            path: plan.path.clone(),
            source,
        })?);
        self.with_retry(&plan.key, || self.store.put_object(&plan.key, body.clone()))
            .await
            .map_err(|source| UploadError::Storage {
                key: plan.key.clone(),
                source,
            })
    }

    async fn upload_chunked(&self, plan: &UploadPlan) -> Result<(), UploadError> {
        let key = plan.key.as_str();
        let mut file = tokio::fs::File::open(&plan.path)
            .await
            .map_err(|source| UploadError::Io {
                path: plan.path.clone(),
                source,
            })?;

        let upload_id = self
            .with_retry(key, || self.store.create_multipart(key))
            .await
            .map_err(|source| UploadError::Storage {
                key: key.to_string(),
                source,
            })?;
        debug!(key, %upload_id, "multi-part upload opened");

        let mut parts: Vec<CompletedChunk> = Vec::new();
        let mut part_number: i32 = 1;
        loop {
            let mut buf = Vec::with_capacity(self.chunk_size.min(plan.size) as usize);
            if let Err(source) = (&mut file).take(self.chunk_size).read_to_end(&mut buf).await {
                self.abort(key, &upload_id).await;
                return Err(UploadError::Io {
                    path: plan.path.clone(),
                    source,
                });
            }
            if buf.is_empty() {
                break;
            }

            let body = Bytes::from(buf);
            let uploaded = self
                .with_retry(key, || self.store.upload_part(key, &upload_id, part_number, body.clone()))
                .await;
            match uploaded {
                Ok(etag) => {
                    debug!(key, part_number, size = body.len(), "chunk uploaded");
                    parts.push(CompletedChunk { part_number, etag });
                }
                Err(source) => {
                    self.abort(key, &upload_id).await;
                    return Err(UploadError::ChunkedUploadAbort {
                        key: key.to_string(),
                        part_number,
                        source,
                    });
                }
            }
            part_number += 1;
        }

        if let Err(source) = self
            .with_retry(key, || self.store.complete_multipart(key, &upload_id, &parts))
            .await
        {
            self.abort(key, &upload_id).await;
            return Err(UploadError::Storage {
                key: key.to_string(),
                source,
            });
        }
        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        match self.store.abort_multipart(key, upload_id).await {
            Ok(()) => info!(key, upload_id, "multi-part upload aborted"),
            Err(err) => warn!(key, upload_id, error = %err, "failed to abort multi-part upload"),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Only transient errors are retried.
    async fn with_retry<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && self.retry.allows_retry_after(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(key, attempt, transient = err.is_transient(), "giving up");
                    return Err(err);
                }
            }
        }
    }
}

/// Regular files directly inside `dir`, sorted by path, with their sizes.
/// Symlinks are followed; an entry that cannot be inspected is skipped.
async fn list_files(dir: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => files.push((path, meta.len())),
            Ok(_) => {}
            Err(err) => warn!(file = %path.display(), error = %err, "cannot inspect file, skipping"),
        }
    }
    files.sort();
    Ok(files)
}
