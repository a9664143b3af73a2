//! [`ObjectStore`] on Amazon S3 or any S3-compatible endpoint.
//!
//! Credentials come from the standard AWS provider chain
//! (`AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`, profiles, instance roles).

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use tracing::info;

use super::store::{CompletedChunk, ObjectStore, StorageError, StorageErrorKind};
use crate::config::StorageConfig;

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::new(
                StorageErrorKind::Validation,
                "no storage bucket configured (set storage.bucket or AWS_BUCKET_NAME)",
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        info!(bucket = %config.bucket, "object storage client ready");
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::new(StorageErrorKind::Other, "multi-part upload created without an id"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::new(StorageErrorKind::Other, format!("part {part_number} stored without an etag")))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedChunk],
    ) -> Result<(), StorageError> {
        let parts = parts
            .iter()
            .map(|chunk| {
                CompletedPart::builder()
                    .part_number(chunk.part_number)
                    .e_tag(&chunk.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) => StorageErrorKind::Timeout,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => StorageErrorKind::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ConstructionFailure(_) => StorageErrorKind::Other,
        _ => match kind_for_code(err.code()) {
            StorageErrorKind::Other => err
                .raw_response()
                .map(|response| kind_for_status(response.status().as_u16()))
                .unwrap_or(StorageErrorKind::Other),
            kind => kind,
        },
    };
    StorageError::new(kind, DisplayErrorContext(&err).to_string())
}

/// Map an S3 error code onto the retry classification.
pub(crate) fn kind_for_code(code: Option<&str>) -> StorageErrorKind {
    match code {
        Some(
            "SlowDown" | "Throttling" | "ThrottlingException" | "TooManyRequests" | "RequestLimitExceeded"
            | "ServiceUnavailable",
        ) => StorageErrorKind::Throttling,
        Some("RequestTimeout" | "RequestTimeoutException") => StorageErrorKind::Timeout,
        Some(
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken"
            | "AllAccessDisabled",
        ) => StorageErrorKind::Auth,
        Some(
            "InvalidArgument" | "InvalidRequest" | "InvalidBucketName" | "NoSuchBucket" | "NoSuchUpload"
            | "InvalidPart" | "InvalidPartOrder" | "EntityTooSmall" | "EntityTooLarge" | "KeyTooLongError"
            | "MalformedXML",
        ) => StorageErrorKind::Validation,
        _ => StorageErrorKind::Other,
    }
}

fn kind_for_status(status: u16) -> StorageErrorKind {
    match status {
        408 => StorageErrorKind::Timeout,
        429 | 503 => StorageErrorKind::Throttling,
        401 | 403 => StorageErrorKind::Auth,
        400 | 404 | 411 | 413 => StorageErrorKind::Validation,
        _ => StorageErrorKind::Other,
    }
}
