pub mod s3;
pub mod store;
pub mod uploader;

pub use s3::S3Store;
pub use store::{CompletedChunk, ObjectStore, StorageError, StorageErrorKind};
pub use uploader::{ArtifactUploader, TransferMode, UploadError, UploadPlan, destination_key};
