//! Trait-level tests against the backend enum, covering the behavior the
//! transfer engine relies on: dispatch, listing shapes, ranged reads, and
//! partial batch-delete reporting.
#![cfg(all(feature = "storage-in-memory", feature = "storage-fs"))]

use bytes::Bytes;
use futures::TryStreamExt;
use stevedore_io::{
    fs::FsStorage, memory::MemoryStorage, BatchDeleteResult, Location, ObjectEntry, PutBody,
    PutOptions, Storage, StorageBackend, WriteAt,
};
use tokio::sync::Mutex;

/// Collects `write_at` payloads into a flat buffer, assuming in-order
/// delivery (the engine's ordered writer owns reordering).
#[derive(Debug, Default)]
struct SinkBuffer {
    data: Mutex<Vec<u8>>,
}

impl SinkBuffer {
    async fn contents(&self) -> Vec<u8> {
        self.data.lock().await.clone()
    }
}

impl WriteAt for SinkBuffer {
    async fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        let mut data = self.data.lock().await;
        let offset = usize::try_from(offset).expect("offset fits usize in tests");
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

fn url(raw: &str) -> Location {
    Location::parse(raw).unwrap()
}

async fn seeded_memory() -> MemoryStorage {
    let memory = MemoryStorage::new();
    memory.create_bucket("bucket").await;
    memory.insert_object("bucket", "a/one.txt", "1111").await;
    memory.insert_object("bucket", "a/two.txt", "22").await;
    memory.insert_object("bucket", "a/sub/three.txt", "333").await;
    memory.insert_object("bucket", "b/four.txt", "4").await;
    memory
}

#[tokio::test]
async fn test_backend_dispatch_stat() {
    let backend = StorageBackend::from(seeded_memory().await);
    let entry = backend.stat(&url("s3://bucket/a/one.txt")).await.unwrap();
    assert_eq!(entry.size, 4);
    assert!(entry.etag.is_some());

    let missing = backend.stat(&url("s3://bucket/zzz")).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_recursive_list_is_flat() {
    let backend = StorageBackend::from(seeded_memory().await);
    let entries: Vec<ObjectEntry> = backend
        .list(&url("s3://bucket/a/"), true, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let keys: Vec<String> = entries
        .iter()
        .map(|e| e.location.as_s3().unwrap().key().to_string())
        .collect();
    assert_eq!(keys, vec!["a/one.txt", "a/sub/three.txt", "a/two.txt"]);
}

#[tokio::test]
async fn test_hierarchical_list_collapses_subdirectories() {
    let backend = StorageBackend::from(seeded_memory().await);
    let entries: Vec<ObjectEntry> = backend
        .list(&url("s3://bucket/a/"), false, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let dirs: Vec<_> = entries.iter().filter(|e| e.is_dir).collect();
    let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
    assert_eq!(dirs.len(), 1);
    assert_eq!(dirs[0].location.as_s3().unwrap().key(), "a/sub/");
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn test_get_full_and_ranged() {
    let backend = StorageBackend::from(seeded_memory().await);

    let sink = SinkBuffer::default();
    let n = backend
        .get(&url("s3://bucket/a/one.txt"), &sink, None)
        .await
        .unwrap();
    assert_eq!(n, 4);
    assert_eq!(sink.contents().await, b"1111");

    let sink = SinkBuffer::default();
    let n = backend
        .get(&url("s3://bucket/a/sub/three.txt"), &sink, Some(1..3))
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(&sink.contents().await[1..3], b"33");
}

#[tokio::test]
async fn test_put_copy_delete_roundtrip() {
    let backend = StorageBackend::from(seeded_memory().await);

    backend
        .put(
            PutBody::Bytes(Bytes::from_static(b"fresh")),
            &url("s3://bucket/new.bin"),
            &PutOptions::default(),
        )
        .await
        .unwrap();
    backend
        .copy(
            &url("s3://bucket/new.bin"),
            &url("s3://bucket/copied.bin"),
            &PutOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        backend.stat(&url("s3://bucket/copied.bin")).await.unwrap().size,
        5
    );

    backend.delete(&url("s3://bucket/new.bin")).await.unwrap();
    assert!(backend
        .stat(&url("s3://bucket/new.bin"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_batch_delete_partial_failure_split() {
    let memory = seeded_memory().await;
    memory.fail_delete_of("bucket", "a/two.txt").await;
    let backend = StorageBackend::from(memory.clone());

    let result = backend
        .delete_batch(vec![
            url("s3://bucket/a/one.txt"),
            url("s3://bucket/a/two.txt"),
            url("s3://bucket/b/four.txt"),
        ])
        .await
        .unwrap();

    match result {
        BatchDeleteResult::PartialFailure { deleted, errors } => {
            assert_eq!(deleted.len(), 2);
            assert_eq!(errors.len(), 1);
            assert_eq!(
                errors[0].location.as_deref(),
                Some("s3://bucket/a/two.txt")
            );
        }
        BatchDeleteResult::AllSuccessful => panic!("expected a partial failure"),
    }
    assert_eq!(memory.delete_batch_calls(), 1);
}

#[tokio::test]
async fn test_fs_backend_ranged_get() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    std::fs::write(&path, b"0123456789").unwrap();

    let backend = StorageBackend::from(FsStorage::new());
    let sink = SinkBuffer::default();
    let n = backend
        .get(
            &Location::parse(path.to_string_lossy()).unwrap(),
            &sink,
            Some(2..6),
        )
        .await
        .unwrap();
    assert_eq!(n, 4);
    assert_eq!(&sink.contents().await[2..6], b"2345");
}

#[tokio::test]
async fn test_bucket_listing_and_creation() {
    let backend = StorageBackend::from(seeded_memory().await);

    backend.make_bucket("another").await.unwrap();
    let buckets = backend.list_buckets(None).await.unwrap();
    let names: Vec<_> = buckets.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["another", "bucket"]);

    let filtered = backend.list_buckets(Some("an")).await.unwrap();
    assert_eq!(filtered.len(), 1);

    let err = backend.make_bucket("bucket").await.unwrap_err();
    assert_eq!(err.kind(), stevedore_io::ErrorKind::PreconditionFailed);
}
