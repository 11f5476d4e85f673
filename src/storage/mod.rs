//! Object storage used to move workspace archives to and from the build VM.
//!
//! Archives are staged here between the local host and the build VM. Only
//! whole-object writes and reads are needed.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod gcs;

pub use gcs::{GcsClient, STORAGE_API_BASE, STORAGE_UPLOAD_BASE};

/// Address of one object in a bucket.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectRef {
    /// Bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
}

impl ObjectRef {
    /// Creates a reference to `bucket/key`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// `gs://` URI, used when logging.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.key)
    }
}

/// Future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Whole-object access to a bucket.
pub trait ObjectStore: Send + Sync {
    /// Creates or replaces `bucket/key` with `bytes`.
    fn write_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        bytes: Vec<u8>,
    ) -> StorageFuture<'a, ()>;

    /// Reads the full contents of `bucket/key`.
    fn read_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> StorageFuture<'a, Vec<u8>>;
}

/// Errors raised by an [`ObjectStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// The object (or its bucket) does not exist.
    #[error("object gs://{bucket}/{key} not found")]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// The storage API rejected the request.
    #[error("storage API returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Provider error message.
        message: String,
    },
    /// No access token could be obtained.
    #[error("storage authentication failed: {0}")]
    Auth(String),
    /// The request failed before a response arrived.
    #[error("storage transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}
