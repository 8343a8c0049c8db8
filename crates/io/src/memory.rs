use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, stream::BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::{
    error::{ErrorKind, InvalidLocationError},
    BatchDeleteError, BatchDeleteResult, BucketEntry, DeleteBatchFatalError, DeleteError, IOError,
    Location, ObjectEntry, PutBody, PutOptions, ReadError, S3Location, StatError, Storage,
    StorageClass, WriteAt, WriteError,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
    storage_class: Option<StorageClass>,
}

/// In-memory storage for tests: `s3://`-addressed objects held in nested
/// maps, with instrumentation the engine scenarios assert on (bulk-delete
/// call counts, the maximum number of operations observed in flight) and
/// injectable per-key delete failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    buckets: Arc<Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>>,
    fail_deletes: Arc<Mutex<HashSet<String>>>,
    etag_seq: Arc<AtomicUsize>,
    delete_batch_calls: Arc<AtomicUsize>,
    delete_batch_sizes: Arc<std::sync::Mutex<Vec<usize>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    op_delay: Option<Duration>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation take at least `delay`, so tests can observe
    /// overlap and cancel mid-run.
    #[must_use]
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    pub async fn create_bucket(&self, bucket: impl Into<String>) {
        self.buckets
            .lock()
            .await
            .entry(bucket.into())
            .or_default();
    }

    pub async fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.insert_object_with(bucket, key, data, None, Utc::now())
            .await;
    }

    pub async fn insert_object_with(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        storage_class: Option<StorageClass>,
        last_modified: DateTime<Utc>,
    ) {
        let etag = format!("etag-{}", self.etag_seq.fetch_add(1, Ordering::Relaxed));
        self.buckets
            .lock()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.into(),
                    last_modified,
                    etag,
                    storage_class,
                },
            );
    }

    /// Mark `s3://bucket/key` so that deleting it fails, single or batched.
    pub async fn fail_delete_of(&self, bucket: &str, key: &str) {
        self.fail_deletes
            .lock()
            .await
            .insert(format!("{bucket}/{key}"));
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .lock()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|stored| stored.data.clone())
    }

    pub async fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .await
            .get(bucket)
            .map_or(0, BTreeMap::len)
    }

    /// Number of `delete_batch` invocations so far.
    #[must_use]
    pub fn delete_batch_calls(&self) -> usize {
        self.delete_batch_calls.load(Ordering::Relaxed)
    }

    /// Key counts of each `delete_batch` invocation, in call order.
    #[must_use]
    pub fn delete_batch_sizes(&self) -> Vec<usize> {
        self.delete_batch_sizes
            .lock()
            .expect("sizes lock is never poisoned")
            .clone()
    }

    /// Highest number of storage operations that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    async fn track(&self) -> InFlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Storage for MemoryStorage {
    async fn stat(&self, location: &Location) -> Result<ObjectEntry, StatError> {
        let _guard = self.track().await;
        let s3_location = require_s3(location)?;
        let buckets = self.buckets.lock().await;
        let stored = buckets
            .get(s3_location.bucket())
            .and_then(|objects| objects.get(s3_location.key()))
            .ok_or_else(|| {
                IOError::new(ErrorKind::NotFound, "object does not exist")
                    .at(location.to_string())
            })?;

        let mut entry = ObjectEntry::builder()
            .location(location.clone())
            .size(stored.data.len() as u64)
            .build();
        entry.last_modified = Some(stored.last_modified);
        entry.etag = Some(stored.etag.clone());
        entry.storage_class = stored.storage_class.clone();
        Ok(entry)
    }

    async fn list(
        &self,
        location: &Location,
        recursive: bool,
        max_items: Option<usize>,
    ) -> Result<BoxStream<'static, Result<ObjectEntry, IOError>>, InvalidLocationError> {
        let _guard = self.track().await;
        let s3_location = require_s3(location)?;
        let prefix = s3_location.prefix().to_string();
        let use_delimiter = !recursive && s3_location.delimiter() == "/";

        let buckets = self.buckets.lock().await;
        let objects = buckets.get(s3_location.bucket()).cloned().unwrap_or_default();
        drop(buckets);

        let mut entries: Vec<Result<ObjectEntry, IOError>> = Vec::new();
        let mut seen_prefixes: HashSet<String> = HashSet::new();
        for (key, stored) in objects.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if use_delimiter {
                if let Some(slash) = key[prefix.len()..].find('/') {
                    let collapsed = &key[..prefix.len() + slash + 1];
                    if seen_prefixes.insert(collapsed.to_string()) {
                        let marker = S3Location::new(s3_location.bucket(), collapsed)
                            .expect("collapsed prefix is a valid key");
                        entries.push(Ok(ObjectEntry::builder()
                            .location(Location::S3(marker))
                            .is_dir(true)
                            .build()));
                    }
                    continue;
                }
            }
            let object_location = S3Location::new(s3_location.bucket(), key.as_str())
                .expect("stored key is a valid key");
            let mut entry = ObjectEntry::builder()
                .location(Location::S3(object_location))
                .size(stored.data.len() as u64)
                .is_dir(key.ends_with('/'))
                .build();
            entry.last_modified = Some(stored.last_modified);
            entry.etag = Some(stored.etag.clone());
            entry.storage_class = stored.storage_class.clone();
            entries.push(Ok(entry));
        }

        let entries = match max_items {
            Some(limit) => stream::iter(entries).take(limit).boxed(),
            None => stream::iter(entries).boxed(),
        };
        Ok(entries)
    }

    async fn get<W: WriteAt + Sync>(
        &self,
        location: &Location,
        writer: &W,
        range: Option<std::ops::Range<u64>>,
    ) -> Result<u64, ReadError> {
        let _guard = self.track().await;
        let s3_location = require_s3(location)?;
        let buckets = self.buckets.lock().await;
        let stored = buckets
            .get(s3_location.bucket())
            .and_then(|objects| objects.get(s3_location.key()))
            .ok_or_else(|| {
                IOError::new(ErrorKind::NotFound, "object does not exist")
                    .at(location.to_string())
            })?;
        let data = stored.data.clone();
        drop(buckets);

        let (offset, slice) = match range {
            Some(range) => {
                let start = usize::try_from(range.start).unwrap_or(usize::MAX);
                let end = usize::try_from(range.end).unwrap_or(usize::MAX);
                let start = std::cmp::min(start, data.len());
                let end = std::cmp::min(end, data.len());
                (range.start, data.slice(start..end))
            }
            None => (0, data),
        };

        writer.write_at(&slice, offset).await.map_err(|e| {
            IOError::new(ErrorKind::Other, format!("Could not deliver bytes: {e}"))
                .at(location.to_string())
        })?;
        Ok(slice.len() as u64)
    }

    async fn put(
        &self,
        body: PutBody,
        location: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let _guard = self.track().await;
        let s3_location = require_s3(location)?;
        let data = match body {
            PutBody::Bytes(bytes) => bytes,
            PutBody::File(path) => Bytes::from(tokio::fs::read(&path).await.map_err(|e| {
                IOError::new(ErrorKind::Other, format!("Could not read upload source: {e}"))
                    .at(path.display().to_string())
            })?),
        };
        self.insert_object_with(
            s3_location.bucket(),
            s3_location.key(),
            data,
            opts.storage_class.clone(),
            Utc::now(),
        )
        .await;
        Ok(())
    }

    async fn copy(
        &self,
        src: &Location,
        dst: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let _guard = self.track().await;
        let src_location = require_s3(src)?;
        let dst_location = require_s3(dst)?;

        let mut buckets = self.buckets.lock().await;
        let stored = buckets
            .get(src_location.bucket())
            .and_then(|objects| objects.get(src_location.key()))
            .cloned()
            .ok_or_else(|| {
                IOError::new(ErrorKind::NotFound, "object does not exist")
                    .at(src.to_string())
            })?;
        let etag = format!("etag-{}", self.etag_seq.fetch_add(1, Ordering::Relaxed));
        buckets
            .entry(dst_location.bucket().to_string())
            .or_default()
            .insert(
                dst_location.key().to_string(),
                StoredObject {
                    data: stored.data,
                    last_modified: Utc::now(),
                    etag,
                    storage_class: opts
                        .storage_class
                        .clone()
                        .or(stored.storage_class),
                },
            );
        Ok(())
    }

    async fn delete(&self, location: &Location) -> Result<(), DeleteError> {
        let _guard = self.track().await;
        let s3_location = require_s3(location)?;
        let qualified = format!("{}/{}", s3_location.bucket(), s3_location.key());
        if self.fail_deletes.lock().await.contains(&qualified) {
            return Err(IOError::new(ErrorKind::AccessDenied, "delete failure injected by test")
                .at(location.to_string())
                .into());
        }

        let mut buckets = self.buckets.lock().await;
        let removed = buckets
            .get_mut(s3_location.bucket())
            .and_then(|objects| objects.remove(s3_location.key()));
        match removed {
            Some(_) => Ok(()),
            None => Err(IOError::new(ErrorKind::NotFound, "object does not exist")
                .at(location.to_string())
                .into()),
        }
    }

    async fn delete_batch(
        &self,
        locations: Vec<Location>,
    ) -> Result<BatchDeleteResult, DeleteBatchFatalError> {
        let _guard = self.track().await;
        self.delete_batch_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_batch_sizes
            .lock()
            .expect("sizes lock is never poisoned")
            .push(locations.len());

        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        let fail_deletes = self.fail_deletes.lock().await.clone();
        let mut buckets = self.buckets.lock().await;

        for location in locations {
            let s3_location = require_s3(&location)?;
            let qualified = format!("{}/{}", s3_location.bucket(), s3_location.key());
            if fail_deletes.contains(&qualified) {
                errors.push(BatchDeleteError::new(
                    Some(location.to_string()),
                    Some("AccessDenied".to_string()),
                    "delete failure injected by test".to_string(),
                ));
                continue;
            }
            // Bulk deletes succeed for keys that are already gone.
            buckets
                .get_mut(s3_location.bucket())
                .and_then(|objects| objects.remove(s3_location.key()));
            deleted.push(location);
        }

        if errors.is_empty() {
            Ok(BatchDeleteResult::AllSuccessful)
        } else {
            Ok(BatchDeleteResult::PartialFailure { deleted, errors })
        }
    }

    async fn list_buckets(&self, prefix: Option<&str>) -> Result<Vec<BucketEntry>, IOError> {
        let _guard = self.track().await;
        Ok(self
            .buckets
            .lock()
            .await
            .keys()
            .filter(|name| prefix.is_none_or(|prefix| name.starts_with(prefix)))
            .map(|name| BucketEntry {
                name: name.clone(),
                created: None,
            })
            .collect())
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), IOError> {
        let _guard = self.track().await;
        let mut buckets = self.buckets.lock().await;
        if buckets.contains_key(bucket) {
            return Err(IOError::new(ErrorKind::PreconditionFailed, "bucket already exists")
                .at(format!("s3://{bucket}")));
        }
        buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }
}

fn require_s3<'a>(location: &'a Location) -> Result<&'a S3Location, InvalidLocationError> {
    location.as_s3().ok_or_else(|| {
        InvalidLocationError::new(
            location.to_string(),
            "the in-memory backend only addresses s3:// locations",
        )
    })
}
