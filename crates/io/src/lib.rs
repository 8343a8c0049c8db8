#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(clippy::module_name_repetitions, clippy::large_enum_variant)]
#![forbid(unsafe_code)]

use std::{future::Future, ops::Range, path::PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

mod error;
mod location;

pub use error::{
    BatchDeleteError, DeleteBatchFatalError, DeleteError, ErrorKind, IOError,
    InvalidLocationError, ReadError, StatError, WriteError,
};
pub use location::{validate_bucket_name, LocalLocation, Location, S3Location, WILDCARD_CHARS};
pub use tryhard;

#[cfg(feature = "storage-fs")]
pub mod fs;
#[cfg(feature = "storage-in-memory")]
pub mod memory;
#[cfg(feature = "storage-s3")]
pub mod s3;

/// Object storage classes, propagated as-is between listings and writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
pub enum StorageClass {
    #[strum(serialize = "STANDARD")]
    Standard,
    #[strum(serialize = "REDUCED_REDUNDANCY")]
    ReducedRedundancy,
    #[strum(serialize = "STANDARD_IA")]
    StandardIa,
    #[strum(serialize = "GLACIER")]
    Glacier,
    #[strum(default)]
    Other(String),
}

impl StorageClass {
    /// Glacier objects cannot be fetched without a restore; batch
    /// copy/download surfaces them as per-item errors.
    #[must_use]
    pub fn is_glacier(&self) -> bool {
        matches!(self, StorageClass::Glacier)
    }
}

/// One entry of a listing or the result of a stat.
#[derive(Debug, Clone, PartialEq, Eq, typed_builder::TypedBuilder)]
pub struct ObjectEntry {
    pub location: Location,
    #[builder(default)]
    pub size: u64,
    #[builder(default, setter(strip_option))]
    pub last_modified: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub etag: Option<String>,
    #[builder(default, setter(strip_option))]
    pub storage_class: Option<StorageClass>,
    /// Pseudo-directory marker (delimiter listings) or a real directory
    /// (filesystem walks). Skipped by the batch expander.
    #[builder(default)]
    pub is_dir: bool,
}

/// A bucket returned by `list_buckets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

/// Body of a `put`: either a file on disk (streamed by the backend) or an
/// in-memory payload.
#[derive(Debug, Clone)]
pub enum PutBody {
    File(PathBuf),
    Bytes(Bytes),
}

/// Write-side metadata for `put` and `copy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub storage_class: Option<StorageClass>,
}

/// An offset-addressed sink for downloads. Backends deliver each byte range
/// at its offset; the implementation is responsible for ordering. Payload
/// slices are not retained after the call returns.
pub trait WriteAt: Send + Sync {
    fn write_at(
        &self,
        buf: &[u8],
        offset: u64,
    ) -> impl Future<Output = std::io::Result<usize>> + Send;
}

/// Result of a batch delete operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "this `BatchDeleteResult` may be a `PartialFailure` variant, which should be handled"]
pub enum BatchDeleteResult {
    /// All deletions were successful.
    AllSuccessful,
    /// Some deletions failed. This variant forces callers to handle partial
    /// failures explicitly.
    PartialFailure {
        deleted: Vec<Location>,
        errors: Vec<BatchDeleteError>,
    },
}

impl BatchDeleteResult {
    #[must_use]
    pub fn is_all_successful(&self) -> bool {
        matches!(self, BatchDeleteResult::AllSuccessful)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        matches!(self, BatchDeleteResult::PartialFailure { .. })
    }

    /// Returns the list of errors, if any.
    #[must_use]
    pub fn errors(&self) -> Option<&[BatchDeleteError]> {
        match self {
            BatchDeleteResult::AllSuccessful => None,
            BatchDeleteResult::PartialFailure { errors, .. } => Some(errors),
        }
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors().map_or(0, <[BatchDeleteError]>::len)
    }
}

/// The storage capability the transfer engine consumes. One implementation
/// per scheme, dispatched through [`StorageBackend`].
///
/// Retries for transient failures are handled inside the implementations;
/// callers only see terminal errors.
pub trait Storage
where
    Self: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    /// Stat a single object. Not-found is reported as
    /// [`ErrorKind::NotFound`], probed via [`StatError::is_not_found`].
    fn stat(
        &self,
        location: &Location,
    ) -> impl Future<Output = Result<ObjectEntry, StatError>> + Send;

    /// List objects under the location's prefix. Non-recursive listings of
    /// literal locations collapse hierarchy into directory-marker entries;
    /// wildcard locations always list flat (the caller filters through the
    /// location's match pattern). Per-item failures surface as `Err` items.
    fn list(
        &self,
        location: &Location,
        recursive: bool,
        max_items: Option<usize>,
    ) -> impl Future<
        Output = Result<BoxStream<'static, Result<ObjectEntry, IOError>>, InvalidLocationError>,
    > + Send;

    /// Fetch an object (or a byte range of it) into the writer. Large
    /// objects may be split into concurrently-fetched ranges, each delivered
    /// at its offset. Returns the number of bytes delivered.
    fn get<W: WriteAt + Sync>(
        &self,
        location: &Location,
        writer: &W,
        range: Option<Range<u64>>,
    ) -> impl Future<Output = Result<u64, ReadError>> + Send;

    /// Store an object.
    fn put(
        &self,
        body: PutBody,
        location: &Location,
        opts: &PutOptions,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Same-scheme server-side copy.
    fn copy(
        &self,
        src: &Location,
        dst: &Location,
        opts: &PutOptions,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Delete a single object.
    fn delete(&self, location: &Location) -> impl Future<Output = Result<(), DeleteError>> + Send;

    /// Delete a batch of objects in one request where the backend supports
    /// it. Callers keep batches at or below [`MAX_DELETE_BATCH_SIZE`].
    fn delete_batch(
        &self,
        locations: Vec<Location>,
    ) -> impl Future<Output = Result<BatchDeleteResult, DeleteBatchFatalError>> + Send;

    /// List buckets, optionally filtered by a name prefix.
    fn list_buckets(
        &self,
        prefix: Option<&str>,
    ) -> impl Future<Output = Result<Vec<BucketEntry>, IOError>> + Send;

    /// Create a bucket.
    fn make_bucket(&self, bucket: &str) -> impl Future<Output = Result<(), IOError>> + Send;
}

/// Upper bound on keys per bulk-delete request.
pub const MAX_DELETE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, derive_more::From)]
pub enum StorageBackend {
    #[cfg(feature = "storage-s3")]
    S3(crate::s3::S3Storage),
    #[cfg(feature = "storage-fs")]
    Fs(crate::fs::FsStorage),
    #[cfg(feature = "storage-in-memory")]
    Memory(crate::memory::MemoryStorage),
}

impl Storage for StorageBackend {
    async fn stat(&self, location: &Location) -> Result<ObjectEntry, StatError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.stat(location).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.stat(location).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.stat(location).await,
        }
    }

    async fn list(
        &self,
        location: &Location,
        recursive: bool,
        max_items: Option<usize>,
    ) -> Result<BoxStream<'static, Result<ObjectEntry, IOError>>, InvalidLocationError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.list(location, recursive, max_items).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.list(location, recursive, max_items).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.list(location, recursive, max_items).await,
        }
    }

    async fn get<W: WriteAt + Sync>(
        &self,
        location: &Location,
        writer: &W,
        range: Option<Range<u64>>,
    ) -> Result<u64, ReadError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.get(location, writer, range).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.get(location, writer, range).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.get(location, writer, range).await,
        }
    }

    async fn put(
        &self,
        body: PutBody,
        location: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.put(body, location, opts).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.put(body, location, opts).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.put(body, location, opts).await,
        }
    }

    async fn copy(
        &self,
        src: &Location,
        dst: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.copy(src, dst, opts).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.copy(src, dst, opts).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.copy(src, dst, opts).await,
        }
    }

    async fn delete(&self, location: &Location) -> Result<(), DeleteError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.delete(location).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.delete(location).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.delete(location).await,
        }
    }

    async fn delete_batch(
        &self,
        locations: Vec<Location>,
    ) -> Result<BatchDeleteResult, DeleteBatchFatalError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.delete_batch(locations).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.delete_batch(locations).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.delete_batch(locations).await,
        }
    }

    async fn list_buckets(&self, prefix: Option<&str>) -> Result<Vec<BucketEntry>, IOError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.list_buckets(prefix).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.list_buckets(prefix).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.list_buckets(prefix).await,
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), IOError> {
        match self {
            #[cfg(feature = "storage-s3")]
            StorageBackend::S3(storage) => storage.make_bucket(bucket).await,
            #[cfg(feature = "storage-fs")]
            StorageBackend::Fs(storage) => storage.make_bucket(bucket).await,
            #[cfg(feature = "storage-in-memory")]
            StorageBackend::Memory(storage) => storage.make_bucket(bucket).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_parse_display() {
        use std::str::FromStr as _;

        assert_eq!(
            StorageClass::from_str("STANDARD").unwrap(),
            StorageClass::Standard
        );
        assert_eq!(
            StorageClass::from_str("GLACIER").unwrap(),
            StorageClass::Glacier
        );
        assert_eq!(StorageClass::StandardIa.to_string(), "STANDARD_IA");
        assert_eq!(
            StorageClass::ReducedRedundancy.to_string(),
            "REDUCED_REDUNDANCY"
        );
        assert!(StorageClass::Glacier.is_glacier());

        // Unknown classes are carried through uninterpreted.
        let other = StorageClass::from_str("DEEP_ARCHIVE").unwrap();
        assert_eq!(other, StorageClass::Other("DEEP_ARCHIVE".to_string()));
        assert_eq!(other.to_string(), "DEEP_ARCHIVE");
    }
}
