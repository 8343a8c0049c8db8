use std::path::Path;

use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use walkdir::WalkDir;

use crate::{
    error::{ErrorKind, InvalidLocationError},
    BatchDeleteError, BatchDeleteResult, BucketEntry, DeleteBatchFatalError, DeleteError, IOError,
    LocalLocation, Location, ObjectEntry, PutBody, PutOptions, ReadError, StatError, Storage,
    WriteAt, WriteError,
};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Local-filesystem side of a transfer, behind the same trait as the remote
/// backends so batch expansion and preconditions work identically on both
/// ends.
#[derive(Debug, Clone, Default)]
pub struct FsStorage {}

impl FsStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

impl Storage for FsStorage {
    async fn stat(&self, location: &Location) -> Result<ObjectEntry, StatError> {
        let local = require_local(location)?;
        let metadata = tokio::fs::metadata(local.path())
            .await
            .map_err(|e| io_error(&e, "stat", local.path()))?;

        let mut entry = ObjectEntry::builder()
            .location(location.clone())
            .size(metadata.len())
            .is_dir(metadata.is_dir())
            .build();
        entry.last_modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(entry)
    }

    async fn list(
        &self,
        location: &Location,
        recursive: bool,
        max_items: Option<usize>,
    ) -> Result<BoxStream<'static, Result<ObjectEntry, IOError>>, InvalidLocationError> {
        let local = require_local(location)?.clone();
        let root = local.walk_root();
        let max_depth = if recursive { usize::MAX } else { 1 };

        // walkdir is synchronous; bridge it through a channel so listing
        // stays a stream and large trees never materialize at once.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<ObjectEntry, IOError>>(256);
        tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&root).max_depth(max_depth).follow_links(false) {
                let item = match entry {
                    Ok(walked) => walked_entry(&walked),
                    Err(e) => Err(IOError::new(
                        ErrorKind::Other,
                        format!("Could not walk directory: {e}"),
                    )
                    .at(root.display().to_string())),
                };
                if tx.blocking_send(item).is_err() {
                    // Receiver dropped, listing was cancelled.
                    return;
                }
            }
        });

        let entries = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
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
        range: Option<std::ops::Range<u64>>,
    ) -> Result<u64, ReadError> {
        let local = require_local(location)?;
        let mut file = tokio::fs::File::open(local.path())
            .await
            .map_err(|e| io_error(&e, "open", local.path()))?;

        let (mut offset, mut remaining) = match range {
            Some(range) => {
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| io_error(&e, "seek", local.path()))?;
                (range.start, range.end.saturating_sub(range.start))
            }
            None => (0, u64::MAX),
        };

        let start = offset;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        while remaining > 0 {
            let want = std::cmp::min(remaining, READ_BUF_SIZE as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| io_error(&e, "read", local.path()))?;
            if n == 0 {
                break;
            }
            writer.write_at(&buf[..n], offset).await.map_err(|e| {
                IOError::new(ErrorKind::Other, format!("Could not deliver read bytes: {e}"))
                    .at(local.to_string())
            })?;
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(offset - start)
    }

    async fn put(
        &self,
        body: PutBody,
        location: &Location,
        _opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let local = require_local(location)?;
        ensure_parent(local.path()).await?;

        match body {
            PutBody::File(src) => {
                tokio::fs::copy(&src, local.path())
                    .await
                    .map_err(|e| io_error(&e, "copy", local.path()))?;
            }
            PutBody::Bytes(bytes) => {
                tokio::fs::write(local.path(), &bytes)
                    .await
                    .map_err(|e| io_error(&e, "write", local.path()))?;
            }
        }
        Ok(())
    }

    async fn copy(
        &self,
        src: &Location,
        dst: &Location,
        _opts: &PutOptions,
    ) -> Result<(), WriteError> {
        let src_local = require_local(src)?;
        let dst_local = require_local(dst)?;
        ensure_parent(dst_local.path()).await?;

        tokio::fs::copy(src_local.path(), dst_local.path())
            .await
            .map_err(|e| io_error(&e, "copy", dst_local.path()))?;
        Ok(())
    }

    async fn delete(&self, location: &Location) -> Result<(), DeleteError> {
        let local = require_local(location)?;
        tokio::fs::remove_file(local.path())
            .await
            .map_err(|e| io_error(&e, "remove", local.path()))?;
        Ok(())
    }

    async fn delete_batch(
        &self,
        locations: Vec<Location>,
    ) -> Result<BatchDeleteResult, DeleteBatchFatalError> {
        let mut deleted = Vec::new();
        let mut errors = Vec::new();

        for location in locations {
            match self.delete(&location).await {
                Ok(()) => deleted.push(location),
                Err(e) => errors.push(BatchDeleteError::new(
                    Some(location.to_string()),
                    None,
                    e.to_string(),
                )),
            }
        }

        if errors.is_empty() {
            Ok(BatchDeleteResult::AllSuccessful)
        } else {
            Ok(BatchDeleteResult::PartialFailure { deleted, errors })
        }
    }

    async fn list_buckets(&self, _prefix: Option<&str>) -> Result<Vec<BucketEntry>, IOError> {
        Err(IOError::new(
            ErrorKind::Unsupported,
            "the local filesystem has no buckets",
        ))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), IOError> {
        Err(IOError::new(
            ErrorKind::Unsupported,
            format!("cannot create bucket `{bucket}` on the local filesystem"),
        ))
    }
}

fn require_local<'a>(location: &'a Location) -> Result<&'a LocalLocation, InvalidLocationError> {
    location.as_local().ok_or_else(|| {
        InvalidLocationError::new(
            location.to_string(),
            "the filesystem backend only addresses local paths",
        )
    })
}

async fn ensure_parent(path: &Path) -> Result<(), IOError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&e, "create directory", parent))?;
        }
    }
    Ok(())
}

fn walked_entry(walked: &walkdir::DirEntry) -> Result<ObjectEntry, IOError> {
    let path = walked.path();
    let metadata = walked
        .metadata()
        .map_err(|e| io_error(&std::io::Error::other(e), "stat", path))?;

    let mut entry = ObjectEntry::builder()
        .location(Location::Local(LocalLocation::new(
            path.to_string_lossy().into_owned(),
        )))
        .size(metadata.len())
        .is_dir(metadata.is_dir())
        .build();
    entry.last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    Ok(entry)
}

fn io_error(e: &std::io::Error, operation: &str, path: &Path) -> IOError {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
        std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        _ => ErrorKind::Other,
    };
    IOError::new(kind, format!("Filesystem {operation} failed: {e}")).at(path.display().to_string())
}
