//! End-to-end engine scenarios against the in-memory backend: pool drain,
//! batch expansion, cancellation, handlers, and precondition skips.

use std::time::Duration;

use futures::stream;
use stevedore::{Job, JobOptions, Operation, PoolParams, StorageResolver, WorkerPool};
use stevedore_io::{memory::MemoryStorage, Location, StorageBackend};
use tokio_util::sync::CancellationToken;

fn url(raw: &str) -> Location {
    Location::parse(raw).unwrap()
}

fn local(path: &std::path::Path) -> Location {
    Location::parse(path.to_string_lossy()).unwrap()
}

fn pool_for(memory: &MemoryStorage, workers: usize) -> WorkerPool {
    pool_with_cancel(memory, workers, CancellationToken::new())
}

fn pool_with_cancel(memory: &MemoryStorage, workers: usize, cancel: CancellationToken) -> WorkerPool {
    let params = PoolParams::builder()
        .workers(workers)
        .queue_capacity(64)
        .build();
    WorkerPool::new(
        StorageResolver::fixed(StorageBackend::from(memory.clone())),
        &params,
        cancel,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_job_runs_exactly_once() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "victim", "x").await;

    let job = Job::builder()
        .op(Operation::Delete)
        .sources(vec![url("s3://b/victim")])
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(memory.object_count("b").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_batch_copy_expands_to_every_object_bounded_by_workers() {
    const OBJECTS: usize = 10_000;
    const WORKERS: usize = 8;

    let memory = MemoryStorage::new().with_op_delay(Duration::from_millis(1));
    for i in 0..OBJECTS {
        memory.insert_object("b", &format!("src/{i:05}"), "payload").await;
    }

    let job = Job::builder()
        .op(Operation::BatchCopy)
        .sources(vec![url("s3://b/src/*")])
        .dest(url("s3://b/dst/"))
        .build();
    let summary = pool_for(&memory, WORKERS).run(job).await;

    assert_eq!(summary.completed as usize, OBJECTS);
    assert_eq!(summary.failed, 0);
    assert_eq!(memory.object_count("b").await, OBJECTS * 2);
    // Degree of parallelism never exceeds the pool size, and the pool
    // actually ran concurrently.
    assert!(memory.max_in_flight() <= WORKERS);
    assert!(memory.max_in_flight() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_drains_promptly_without_new_dispatch() {
    const OBJECTS: usize = 5_000;

    let memory = MemoryStorage::new().with_op_delay(Duration::from_millis(5));
    for i in 0..OBJECTS {
        memory.insert_object("b", &format!("src/{i:05}"), "x").await;
    }

    let cancel = CancellationToken::new();
    let job = Job::builder()
        .op(Operation::BatchCopy)
        .sources(vec![url("s3://b/src/*")])
        .dest(url("s3://b/dst/"))
        .build();
    let pool = pool_with_cancel(&memory, 4, cancel.clone());

    let run = tokio::spawn(pool.run(job));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("pool drains within a poll interval of cancellation")
        .unwrap();
    assert!(
        (summary.completed as usize) < OBJECTS,
        "cancellation stopped the batch early"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_download_with_parents_reproduces_hierarchy() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "logs/2024/app.log", "aaaa").await;
    memory.insert_object("b", "logs/2024/db.log", "bb").await;
    memory.insert_object("b", "logs/readme.txt", "c").await;
    memory.insert_object("b", "other/skip.log", "zz").await;

    let out = tempfile::tempdir().unwrap();
    let job = Job::builder()
        .op(Operation::BatchDownload)
        .sources(vec![url("s3://b/logs/*")])
        .dest(local(out.path()))
        .opts(JobOptions {
            parents: true,
            ..JobOptions::default()
        })
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        std::fs::read(out.path().join("logs/2024/app.log")).unwrap(),
        b"aaaa"
    );
    assert_eq!(
        std::fs::read(out.path().join("logs/readme.txt")).unwrap(),
        b"c"
    );
    assert!(!out.path().join("other").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_download_without_parents_flattens() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "logs/2024/app.log", "aaaa").await;

    let out = tempfile::tempdir().unwrap();
    let job = Job::builder()
        .op(Operation::BatchDownload)
        .sources(vec![url("s3://b/logs/*")])
        .dest(local(out.path()))
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(std::fs::read(out.path().join("app.log")).unwrap(), b"aaaa");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_upload_walks_local_tree() {
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("sub")).unwrap();
    std::fs::write(src.path().join("a.txt"), b"one").unwrap();
    std::fs::write(src.path().join("sub/b.txt"), b"two").unwrap();

    let memory = MemoryStorage::new();
    memory.create_bucket("b").await;

    let job = Job::builder()
        .op(Operation::BatchUpload)
        .sources(vec![local(src.path())])
        .dest(url("s3://b/up/"))
        .opts(JobOptions {
            recursive: true,
            ..JobOptions::default()
        })
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(memory.object_count("b").await, 2);
    assert_eq!(memory.object("b", "up/a.txt").await.unwrap(), "one");
    assert_eq!(memory.object("b", "up/b.txt").await.unwrap(), "two");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_glacier_objects_fail_batch_download_per_item() {
    use chrono::Utc;
    use stevedore_io::StorageClass;

    let memory = MemoryStorage::new();
    memory.insert_object("b", "data/ok.bin", "fine").await;
    memory
        .insert_object_with(
            "b",
            "data/frozen.bin",
            "cold",
            Some(StorageClass::Glacier),
            Utc::now(),
        )
        .await;

    let out = tempfile::tempdir().unwrap();
    let job = Job::builder()
        .op(Operation::BatchDownload)
        .sources(vec![url("s3://b/data/*")])
        .dest(local(out.path()))
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert!(out.path().join("ok.bin").exists());
    assert!(!out.path().join("frozen.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_failure_removes_partial_file() {
    let memory = MemoryStorage::new();
    memory.create_bucket("b").await;

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("never.bin");
    let job = Job::builder()
        .op(Operation::Download)
        .sources(vec![url("s3://b/missing")])
        .dest(local(&dest))
        .build();
    let summary = pool_for(&memory, 2).run(job).await;

    assert_eq!(summary.failed, 1);
    assert!(!dest.exists(), "partial download artifact was cleaned up");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_deletes_source_after_copy() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "from/x", "data").await;

    let job = Job::builder()
        .op(Operation::Copy)
        .sources(vec![url("s3://b/from/x")])
        .dest(url("s3://b/to/x"))
        .opts(JobOptions {
            delete_source: true,
            ..JobOptions::default()
        })
        .build();
    let summary = pool_for(&memory, 2).run(job).await;

    assert_eq!(summary.completed, 1);
    assert!(memory.object("b", "from/x").await.is_none());
    assert_eq!(memory.object("b", "to/x").await.unwrap(), "data");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_precondition_skip_counts_as_skipped() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "src.bin", "same").await;
    memory.insert_object("b", "dst.bin", "xxxx").await;

    // Same size on both ends with if-size-differs set: skip.
    let job = Job::builder()
        .op(Operation::Copy)
        .sources(vec![url("s3://b/src.bin")])
        .dest(url("s3://b/dst.bin"))
        .opts(JobOptions {
            if_size_differs: true,
            ..JobOptions::default()
        })
        .build();
    let summary = pool_for(&memory, 2).run(job).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wildcard_batch_delete_counts_per_item() {
    let memory = MemoryStorage::new();
    for i in 0..25 {
        memory.insert_object("b", &format!("junk/{i:02}.tmp"), "x").await;
    }
    memory.insert_object("b", "junk/keep.dat", "x").await;
    memory.fail_delete_of("b", "junk/07.tmp").await;

    let job = Job::builder()
        .op(Operation::BatchDelete)
        .sources(vec![url("s3://b/junk/*.tmp")])
        .build();
    let summary = pool_for(&memory, 4).run(job).await;

    assert_eq!(summary.completed, 24);
    assert_eq!(summary.failed, 1);
    assert!(memory.object("b", "junk/keep.dat").await.is_some());
    assert!(memory.object("b", "junk/07.tmp").await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_stream_feeds_multiple_jobs() {
    let memory = MemoryStorage::new();
    memory.insert_object("b", "one", "1").await;
    memory.insert_object("b", "two", "2").await;
    memory.insert_object("b", "three", "3").await;

    let jobs = ["one", "two", "three"].into_iter().map(|key| {
        Job::builder()
            .op(Operation::Delete)
            .sources(vec![url(&format!("s3://b/{key}"))])
            .build()
    });
    let summary = pool_for(&memory, 2)
        .run_stream(stream::iter(jobs.collect::<Vec<_>>()))
        .await;

    assert_eq!(summary.completed, 3);
    assert_eq!(memory.object_count("b").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upload_then_download_roundtrip() {
    let memory = MemoryStorage::new();
    memory.create_bucket("b").await;

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in.txt");
    std::fs::write(&src, b"roundtrip payload").unwrap();

    let upload = Job::builder()
        .op(Operation::Upload)
        .sources(vec![local(&src)])
        .dest(url("s3://b/files/in.txt"))
        .build();
    let summary = pool_for(&memory, 2).run(upload).await;
    assert_eq!(summary.completed, 1);
    assert_eq!(
        memory.object("b", "files/in.txt").await.unwrap(),
        "roundtrip payload"
    );

    let dest = dir.path().join("back.txt");
    let download = Job::builder()
        .op(Operation::Download)
        .sources(vec![url("s3://b/files/in.txt")])
        .dest(local(&dest))
        .build();
    let summary = pool_for(&memory, 2).run(download).await;
    assert_eq!(summary.completed, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), b"roundtrip payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_make_bucket() {
    let memory = MemoryStorage::new();
    let job = Job::builder()
        .op(Operation::MakeBucket)
        .sources(vec![url("s3://fresh-bucket")])
        .build();
    let summary = pool_for(&memory, 2).run(job).await;

    assert_eq!(summary.completed, 1);
    memory.create_bucket("probe").await;
    let backend = StorageBackend::from(memory);
    let buckets = stevedore_io::Storage::list_buckets(&backend, Some("fresh"))
        .await
        .unwrap();
    assert_eq!(buckets.len(), 1);
}
