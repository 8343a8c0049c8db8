use std::{collections::BTreeMap, future::Future, ops::Range, time::Duration};

use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use futures::{stream, StreamExt, TryStreamExt};

use crate::{
    error::{ErrorKind, InvalidLocationError},
    s3::{
        s3_error::{parse_get_object_error, parse_head_object_error, parse_sdk_error},
        S3Settings,
    },
    BatchDeleteError, BatchDeleteResult, BucketEntry, DeleteBatchFatalError, DeleteError, IOError,
    Location, ObjectEntry, PutBody, PutOptions, ReadError, S3Location, StatError, Storage,
    StorageClass, WriteAt, WriteError, MAX_DELETE_BATCH_SIZE,
};

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    settings: S3Settings,
}

impl S3Storage {
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, settings: S3Settings) -> Self {
        Self { client, settings }
    }

    #[must_use]
    pub fn client(&self) -> &aws_sdk_s3::Client {
        &self.client
    }

    #[must_use]
    pub fn settings(&self) -> &S3Settings {
        &self.settings
    }

    /// Fetch one byte range and deliver it at its offset. The send is
    /// retried on transient kinds; a body that fails mid-stream is not,
    /// the whole `get` fails instead.
    async fn fetch_range<W: WriteAt + Sync>(
        &self,
        location: &S3Location,
        writer: &W,
        range: Range<u64>,
    ) -> Result<u64, ReadError> {
        let display = location.to_string();
        let response = retry_io(|| {
            let request = self
                .client
                .get_object()
                .bucket(location.bucket())
                .key(location.key())
                .range(format!("bytes={}-{}", range.start, range.end - 1));
            let display = display.clone();
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| parse_get_object_error(e, &display))
            }
        })
        .await?;

        let mut body = response.body;
        let mut offset = range.start;
        loop {
            let chunk = match body.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Err(IOError::new(
                        ErrorKind::Other,
                        format!("S3 body stream broke off: {e}"),
                    )
                    .at(display)
                    .caused_by(e)
                    .into())
                }
            };
            writer
                .write_at(&chunk, offset)
                .await
                .map_err(|e| writer_error(&e, &display))?;
            offset += chunk.len() as u64;
        }
        Ok(offset - range.start)
    }

    /// Fetch the whole object with a single unranged GET, delivering body
    /// chunks at increasing offsets.
    async fn fetch_whole<W: WriteAt + Sync>(
        &self,
        location: &S3Location,
        writer: &W,
    ) -> Result<u64, ReadError> {
        let display = location.to_string();
        let response = retry_io(|| {
            let request = self
                .client
                .get_object()
                .bucket(location.bucket())
                .key(location.key());
            let display = display.clone();
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| parse_get_object_error(e, &display))
            }
        })
        .await?;

        let mut body = response.body;
        let mut offset = 0u64;
        loop {
            let chunk = match body.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Err(IOError::new(
                        ErrorKind::Other,
                        format!("S3 body stream broke off: {e}"),
                    )
                    .at(display)
                    .caused_by(e)
                    .into())
                }
            };
            writer
                .write_at(&chunk, offset)
                .await
                .map_err(|e| writer_error(&e, &display))?;
            offset += chunk.len() as u64;
        }
        Ok(offset)
    }
}

impl Storage for S3Storage {
    async fn stat(&self, location: &Location) -> Result<ObjectEntry, StatError> {
        let s3_location = require_s3(location)?;
        let display = s3_location.to_string();

        let response = retry_io(|| {
            let request = self
                .client
                .head_object()
                .bucket(s3_location.bucket())
                .key(s3_location.key());
            let display = display.clone();
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| parse_head_object_error(e, &display))
            }
        })
        .await?;

        let mut entry = ObjectEntry::builder()
            .location(location.clone())
            .size(response.content_length().unwrap_or(0).unsigned_abs())
            .build();
        entry.last_modified = response.last_modified().and_then(smithy_to_chrono);
        entry.etag = response.e_tag().map(normalize_etag);
        entry.storage_class = response
            .storage_class()
            .map(|class| parse_storage_class(class.as_str()));
        Ok(entry)
    }

    async fn list(
        &self,
        location: &Location,
        recursive: bool,
        max_items: Option<usize>,
    ) -> Result<futures::stream::BoxStream<'static, Result<ObjectEntry, IOError>>, InvalidLocationError>
    {
        let s3_location = require_s3(location)?.clone();
        let bucket = s3_location.bucket().to_string();
        let display = s3_location.to_string();

        let mut list_request_template = self
            .client
            .list_objects_v2()
            .bucket(bucket.clone())
            .prefix(s3_location.prefix().to_string());
        // Literal prefixes list hierarchically unless the caller asked for
        // recursion; wildcard locations always list flat and get filtered
        // through the match pattern by the caller.
        if !recursive && s3_location.delimiter() == "/" {
            list_request_template = list_request_template.delimiter("/");
        }

        let pages = stream::unfold(
            (None::<String>, false), // (continuation_token, is_done)
            move |(continuation_token, is_done)| {
                let list_request = list_request_template.clone();
                let bucket = bucket.clone();
                let display = display.clone();

                async move {
                    if is_done {
                        return None;
                    }

                    let mut list_request = list_request;
                    if let Some(token) = continuation_token {
                        list_request = list_request.continuation_token(token);
                    }

                    let result = tryhard::retry_fn(|| async {
                        match list_request.clone().send().await {
                            Ok(response) => Ok(Ok(response)),
                            Err(e) => {
                                let error = parse_sdk_error(e, "ListObjectsV2", &display);
                                if error.is_transient() {
                                    Err(error)
                                } else {
                                    Ok(Err(error))
                                }
                            }
                        }
                    })
                    .retries(3)
                    .exponential_backoff(Duration::from_millis(100))
                    .max_delay(Duration::from_secs(10))
                    .await;

                    match result {
                        Ok(Ok(response)) => {
                            let mut entries = Vec::new();
                            for common_prefix in response.common_prefixes() {
                                let Some(prefix) = common_prefix.prefix() else {
                                    continue;
                                };
                                match S3Location::new(bucket.clone(), prefix) {
                                    Ok(marker) => entries.push(Ok(ObjectEntry::builder()
                                        .location(Location::S3(marker))
                                        .is_dir(true)
                                        .build())),
                                    Err(e) => entries.push(Err(IOError::new(
                                        ErrorKind::Other,
                                        format!("Listed prefix is not addressable: {e}"),
                                    )
                                    .at(format!("s3://{bucket}/{prefix}")))),
                                }
                            }
                            for object in response.contents() {
                                let Some(key) = object.key() else { continue };
                                match S3Location::new(bucket.clone(), key) {
                                    Ok(object_location) => {
                                        let mut entry = ObjectEntry::builder()
                                            .location(Location::S3(object_location))
                                            .size(object.size().unwrap_or(0).unsigned_abs())
                                            .is_dir(key.ends_with('/'))
                                            .build();
                                        entry.last_modified =
                                            object.last_modified().and_then(smithy_to_chrono);
                                        entry.etag = object.e_tag().map(normalize_etag);
                                        entry.storage_class = object
                                            .storage_class()
                                            .map(|class| parse_storage_class(class.as_str()));
                                        entries.push(Ok(entry));
                                    }
                                    Err(e) => entries.push(Err(IOError::new(
                                        ErrorKind::Other,
                                        format!("Listed key is not addressable: {e}"),
                                    )
                                    .at(format!("s3://{bucket}/{key}")))),
                                }
                            }

                            let next_continuation_token = response
                                .next_continuation_token()
                                .map(std::string::ToString::to_string);
                            let is_truncated = response.is_truncated().unwrap_or(false);
                            let next_state = (next_continuation_token, !is_truncated);

                            Some((Ok(entries), next_state))
                        }
                        // First case: Retryable error occurred but retries didn't resolve it
                        // Second case: Non-retryable error occurred
                        Ok(Err(error)) | Err(error) => Some((Err(error), (None, true))),
                    }
                }
            },
        );

        let entries = pages.flat_map(|page| match page {
            Ok(entries) => stream::iter(entries).left_stream(),
            Err(error) => stream::iter(vec![Err(error)]).right_stream(),
        });
        let entries = match max_items {
            Some(limit) => entries.take(limit).boxed(),
            None => entries.boxed(),
        };
        Ok(entries)
    }

    async fn get<W: WriteAt + Sync>(
        &self,
        location: &Location,
        writer: &W,
        range: Option<Range<u64>>,
    ) -> Result<u64, ReadError> {
        let s3_location = require_s3(location)?;

        if let Some(range) = range {
            if range.is_empty() {
                return Ok(0);
            }
            return self.fetch_range(s3_location, writer, range).await;
        }

        let size = match self.stat(location).await {
            Ok(entry) => entry.size,
            Err(StatError::InvalidLocation(e)) => return Err(e.into()),
            Err(StatError::IOError(e)) => return Err(e.into()),
        };

        if size < self.settings.range_threshold {
            return self.fetch_whole(s3_location, writer).await;
        }

        let delivered = stream::iter(split_ranges(size, self.settings.range_size))
            .map(|range| self.fetch_range(s3_location, writer, range))
            .buffer_unordered(self.settings.range_concurrency)
            .try_fold(0u64, |acc, n| async move { Ok(acc + n) })
            .await?;
        Ok(delivered)
    }

    async fn put(
        &self,
        body: PutBody,
        location: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let s3_location = require_s3(location)?;
        let display = s3_location.to_string();

        retry_io(|| {
            let body = body.clone();
            let display = display.clone();
            let request = self
                .client
                .put_object()
                .bucket(s3_location.bucket())
                .key(s3_location.key())
                .set_content_type(opts.content_type.clone())
                .set_storage_class(
                    opts.storage_class
                        .as_ref()
                        .map(|class| class.to_string().as_str().into()),
                );
            async move {
                let byte_stream = match body {
                    PutBody::Bytes(bytes) => aws_sdk_s3::primitives::ByteStream::from(bytes),
                    PutBody::File(path) => aws_sdk_s3::primitives::ByteStream::from_path(&path)
                        .await
                        .map_err(|e| {
                            IOError::new(
                                ErrorKind::Other,
                                format!("Could not open upload source: {e}"),
                            )
                            .at(path.display().to_string())
                        })?,
                };
                request
                    .body(byte_stream)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| parse_sdk_error(e, "PutObject", &display))
            }
        })
        .await?;
        Ok(())
    }

    async fn copy(
        &self,
        src: &Location,
        dst: &Location,
        opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let src_location = require_s3(src)?;
        let dst_location = require_s3(dst)?;
        let display = dst_location.to_string();
        let copy_source = format!("{}/{}", src_location.bucket(), src_location.key());

        retry_io(|| {
            let request = self
                .client
                .copy_object()
                .copy_source(copy_source.clone())
                .bucket(dst_location.bucket())
                .key(dst_location.key())
                .set_content_type(opts.content_type.clone())
                .set_storage_class(
                    opts.storage_class
                        .as_ref()
                        .map(|class| class.to_string().as_str().into()),
                );
            let display = display.clone();
            async move {
                request
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| parse_sdk_error(e, "CopyObject", &display))
            }
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, location: &Location) -> Result<(), DeleteError> {
        let s3_location = require_s3(location)?;
        let display = s3_location.to_string();

        retry_io(|| {
            let request = self
                .client
                .delete_object()
                .bucket(s3_location.bucket())
                .key(s3_location.key());
            let display = display.clone();
            async move {
                request
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| parse_sdk_error(e, "DeleteObject", &display))
            }
        })
        .await?;
        Ok(())
    }

    async fn delete_batch(
        &self,
        locations: Vec<Location>,
    ) -> Result<BatchDeleteResult, DeleteBatchFatalError> {
        // Group per bucket; each DeleteObjects request addresses one bucket.
        let mut buckets: BTreeMap<String, Vec<(String, Location)>> = BTreeMap::new();
        for location in locations {
            let s3_location = require_s3(&location)?;
            buckets
                .entry(s3_location.bucket().to_string())
                .or_default()
                .push((s3_location.key().to_string(), location.clone()));
        }

        let mut deleted = Vec::new();
        let mut delete_errors = Vec::new();
        let mut any_error = false;

        for (bucket, keys) in buckets {
            for key_batch in keys.chunks(MAX_DELETE_BATCH_SIZE) {
                let objects: Vec<ObjectIdentifier> = key_batch
                    .iter()
                    .map(|(key, _)| {
                        ObjectIdentifier::builder().key(key).build().map_err(|e| {
                            InvalidLocationError::new(
                                format!("s3://{bucket}/{key}"),
                                format!("Could not build S3 ObjectIdentifier: {e}"),
                            )
                        })
                    })
                    .collect::<Result<_, _>>()?;

                let output = self
                    .client
                    .delete_objects()
                    .bucket(&bucket)
                    .delete(
                        Delete::builder()
                            .set_objects(Some(objects))
                            .build()
                            .map_err(|e| {
                                InvalidLocationError::new(
                                    format!("s3://{bucket}"),
                                    format!("Could not build S3 Delete: {e}"),
                                )
                            })?,
                    )
                    .send()
                    .await
                    .map_err(|e| parse_sdk_error(e, "DeleteObjects", &format!("s3://{bucket}")))?;

                for deleted_object in output.deleted() {
                    if let Some(key) = deleted_object.key() {
                        if let Some((_, location)) =
                            key_batch.iter().find(|(batch_key, _)| batch_key == key)
                        {
                            deleted.push(location.clone());
                        }
                    }
                }
                for error in output.errors() {
                    any_error = true;
                    tracing::debug!(
                        "bulk delete rejected key {:?} in bucket `{bucket}`: {:?} {:?}",
                        error.key(),
                        error.code(),
                        error.message()
                    );
                    delete_errors.push(BatchDeleteError::new(
                        error.key().map(|key| format!("s3://{bucket}/{key}")),
                        error.code().map(String::from),
                        error.message().unwrap_or("unknown error").to_string(),
                    ));
                }
            }
        }

        if any_error {
            Ok(BatchDeleteResult::PartialFailure {
                deleted,
                errors: delete_errors,
            })
        } else {
            Ok(BatchDeleteResult::AllSuccessful)
        }
    }

    async fn list_buckets(&self, prefix: Option<&str>) -> Result<Vec<BucketEntry>, IOError> {
        let response = retry_io(|| {
            let request = self.client.list_buckets();
            async move {
                request
                    .send()
                    .await
                    .map_err(|e| parse_sdk_error(e, "ListBuckets", "s3://"))
            }
        })
        .await?;

        Ok(response
            .buckets()
            .iter()
            .filter_map(|bucket| {
                let name = bucket.name()?.to_string();
                if let Some(prefix) = prefix {
                    if !name.starts_with(prefix) {
                        return None;
                    }
                }
                Some(BucketEntry {
                    name,
                    created: bucket.creation_date().and_then(smithy_to_chrono),
                })
            })
            .collect())
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), IOError> {
        let display = format!("s3://{bucket}");
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 is the API default and rejects an explicit constraint.
        if let Some(region) = self
            .settings
            .region
            .as_deref()
            .filter(|region| *region != "us-east-1")
        {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map(|_| ())
            .map_err(|e| parse_sdk_error(e, "CreateBucket", &display))
    }
}

fn require_s3<'a>(location: &'a Location) -> Result<&'a S3Location, InvalidLocationError> {
    location.as_s3().ok_or_else(|| {
        InvalidLocationError::new(
            location.to_string(),
            "the S3 backend only addresses s3:// locations",
        )
    })
}

/// Cut `[0, total)` into consecutive pieces of at most `piece` bytes, the
/// last one taking whatever remains.
fn split_ranges(total: u64, piece: u64) -> Vec<Range<u64>> {
    let piece = piece.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < total {
        let end = std::cmp::min(start + piece, total);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Retry an operation on transient error kinds with the backend's standard
/// backoff.
async fn retry_io<T, Fut, F>(mut make_attempt: F) -> Result<T, IOError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IOError>>,
{
    let result = tryhard::retry_fn(|| {
        let attempt = make_attempt();
        async move {
            match attempt.await {
                Ok(value) => Ok(Ok(value)),
                Err(e) if e.is_transient() => Err(e),
                Err(e) => Ok(Err(e)),
            }
        }
    })
    .retries(3)
    .exponential_backoff(Duration::from_millis(100))
    .max_delay(Duration::from_secs(10))
    .await;

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) | Err(e) => Err(e),
    }
}

fn writer_error(e: &std::io::Error, location: &str) -> IOError {
    IOError::new(
        ErrorKind::Other,
        format!("Could not deliver downloaded bytes: {e}"),
    )
    .at(location)
}

fn smithy_to_chrono(dt: &aws_smithy_types::DateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn parse_storage_class(raw: &str) -> StorageClass {
    raw.parse()
        .unwrap_or_else(|_| StorageClass::Other(raw.to_string()))
}

fn normalize_etag(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_uneven_tail() {
        assert_eq!(split_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_ranges(9, 3), vec![0..3, 3..6, 6..9]);
    }

    #[test]
    fn test_split_ranges_degenerate_inputs() {
        assert!(split_ranges(0, 4).is_empty());
        assert_eq!(split_ranges(2, 100), vec![0..2]);
        assert_eq!(split_ranges(3, 0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
    }

    #[test]
    fn test_parse_storage_class() {
        assert_eq!(parse_storage_class("GLACIER"), StorageClass::Glacier);
        assert_eq!(
            parse_storage_class("INTELLIGENT_TIERING"),
            StorageClass::Other("INTELLIGENT_TIERING".to_string())
        );
    }

    #[test]
    fn test_smithy_to_chrono() {
        let dt = aws_smithy_types::DateTime::from_secs(1_700_000_000);
        let converted = smithy_to_chrono(&dt).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }
}
