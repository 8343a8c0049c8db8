//! Per-operation job handlers. Each handler resolves the backends it
//! needs, performs one storage call, and handles the post-action side
//! effect (source deletion, partial-file cleanup).

use futures::{stream, StreamExt};
use humansize::{FormatSizeOptions, DECIMAL};
use stevedore_io::{Location, ObjectEntry, PutBody, PutOptions, Storage as _};

use crate::{
    condition::{check, Decision},
    contenttype,
    delete::multi_delete,
    expand,
    job::{Job, JobOptions, Operation},
    ordered::OrderedWriter,
    pool::JobContext,
    JobError,
};

/// Run one job to completion, record its outcome, and emit its log line.
pub(crate) async fn run_job(ctx: &JobContext, job: Job, sub_tx: &async_channel::Sender<Job>) {
    let label = job.to_string();
    match dispatch(ctx, &job, sub_tx).await {
        Ok(Outcome::Done) => {
            ctx.counters.add_completed(1);
            tracing::info!("{label}");
        }
        Ok(Outcome::Skipped(reason)) => {
            ctx.counters.add_skipped(1);
            tracing::warn!("{label}: skipped, {reason}");
        }
        Ok(Outcome::CountedPerItem) => {}
        Err(e) if ctx.cancel.is_cancelled() => {
            tracing::debug!("{label}: abandoned after cancellation: {e}");
        }
        Err(e) => {
            ctx.counters.add_failed(1);
            tracing::error!("{label}: {e}");
        }
    }
}

enum Outcome {
    Done,
    Skipped(&'static str),
    /// Batch operations account their results per item.
    CountedPerItem,
}

async fn dispatch(
    ctx: &JobContext,
    job: &Job,
    sub_tx: &async_channel::Sender<Job>,
) -> Result<Outcome, JobError> {
    match job.op {
        Operation::Copy | Operation::LocalCopy => copy(ctx, job).await,
        Operation::Download => download(ctx, job).await,
        Operation::Upload => upload(ctx, job).await,
        Operation::Cat => cat(ctx, job).await,
        Operation::Delete => delete_one(ctx, job).await,
        Operation::BatchDelete => batch_delete(ctx, job).await,
        Operation::List => list(ctx, job).await,
        Operation::DiskUsage => disk_usage(ctx, job).await,
        Operation::MakeBucket => make_bucket(ctx, job).await,
        Operation::BatchDownload
        | Operation::BatchUpload
        | Operation::BatchCopy
        | Operation::BatchLocalCopy => run_batch(ctx, job, sub_tx).await,
    }
}

async fn run_batch(
    ctx: &JobContext,
    job: &Job,
    sub_tx: &async_channel::Sender<Job>,
) -> Result<Outcome, JobError> {
    let stats = expand::expand(ctx, job, sub_tx).await?;
    ctx.counters.add_failed(stats.item_failures);
    tracing::debug!("expanded `{job}` into {} sub-jobs", stats.enqueued);
    Ok(Outcome::CountedPerItem)
}

async fn copy(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let dest = required_dest(job)?;
    let src_storage = ctx.resolver.resolve(src).await;
    let dst_storage = ctx.resolver.resolve(dest).await;

    if let Decision::Skip(reason) = check(&src_storage, &dst_storage, src, dest, &job.opts).await? {
        return Ok(Outcome::Skipped(reason));
    }

    let opts = PutOptions {
        content_type: None,
        storage_class: job.storage_class.clone(),
    };
    dst_storage.copy(src, dest, &opts).await?;
    if job.opts.delete_source {
        src_storage.delete(src).await?;
    }
    Ok(Outcome::Done)
}

async fn download(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let dest = required_dest(job)?;
    let dest_local = dest
        .as_local()
        .ok_or_else(|| JobError::Unsupported("download destination must be local".to_string()))?;
    let src_storage = ctx.resolver.resolve(src).await;
    let dst_storage = ctx.resolver.resolve(dest).await;

    if let Decision::Skip(reason) = check(&src_storage, &dst_storage, src, dest, &job.opts).await? {
        return Ok(Outcome::Skipped(reason));
    }

    if let Some(parent) = dest_local.path().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = tokio::fs::File::create(dest_local.path()).await?;
    let writer = OrderedWriter::new(file);

    match src_storage.get(src, &writer, None).await {
        Ok(_) => {
            if let Err(e) = writer.finish().await {
                let _ = tokio::fs::remove_file(dest_local.path()).await;
                return Err(e.into());
            }
        }
        Err(e) => {
            // Never leave a partial file behind.
            drop(writer);
            let _ = tokio::fs::remove_file(dest_local.path()).await;
            return Err(e.into());
        }
    }

    if job.opts.delete_source {
        src_storage.delete(src).await?;
    }
    Ok(Outcome::Done)
}

async fn upload(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let src_local = src
        .as_local()
        .ok_or_else(|| JobError::Unsupported("upload source must be local".to_string()))?;
    let dest = required_dest(job)?;
    let src_storage = ctx.resolver.resolve(src).await;
    let dst_storage = ctx.resolver.resolve(dest).await;

    if let Decision::Skip(reason) = check(&src_storage, &dst_storage, src, dest, &job.opts).await? {
        return Ok(Outcome::Skipped(reason));
    }

    let content_type = contenttype::detect(src_local.path()).await;
    let opts = PutOptions {
        content_type,
        storage_class: job.storage_class.clone(),
    };
    dst_storage
        .put(PutBody::File(src_local.path().to_path_buf()), dest, &opts)
        .await?;

    if job.opts.delete_source {
        src_storage.delete(src).await?;
    }
    Ok(Outcome::Done)
}

async fn cat(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let src_storage = ctx.resolver.resolve(src).await;

    // stdout is the canonical non-seekable sink: ranges land in parallel,
    // bytes leave in order.
    let writer = OrderedWriter::new(tokio::io::stdout());
    src_storage.get(src, &writer, None).await?;
    writer.finish().await?;
    Ok(Outcome::Done)
}

async fn delete_one(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let storage = ctx.resolver.resolve(src).await;
    storage.delete(src).await?;
    Ok(Outcome::Done)
}

async fn batch_delete(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let storage = ctx.resolver.resolve(job.source()).await;

    let expand_listing =
        job.sources.len() == 1 && (job.source().is_wildcard() || job.opts.recursive);
    let candidates = if expand_listing {
        let src = job.source().clone();
        let entries = storage.list(&src, true, None).await?;
        let counters = ctx.counters.clone();
        entries
            .filter_map(move |item| {
                let src = src.clone();
                let counters = counters.clone();
                async move {
                    match item {
                        Ok(entry) if entry.is_dir => None,
                        Ok(entry) if expand::entry_matches(&src, &entry) => Some(entry.location),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::warn!("Skipping unreadable list item: {e}");
                            counters.add_failed(1);
                            None
                        }
                    }
                }
            })
            .boxed()
    } else {
        stream::iter(job.sources.clone()).boxed()
    };

    let mut results = multi_delete(storage, candidates, ctx.cancel.clone());
    while let Some(outcome) = results.next().await {
        match &outcome.error {
            None => {
                ctx.counters.add_completed(1);
                tracing::info!("rm {}", outcome.location);
            }
            Some(e) => {
                ctx.counters.add_failed(1);
                tracing::error!("rm {}: {e}", outcome.location);
            }
        }
    }
    Ok(Outcome::CountedPerItem)
}

async fn list(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    // Bare `ls` lists buckets.
    let Some(src) = job.sources.first() else {
        let storage = ctx.resolver.resolve_remote().await;
        for bucket in storage.list_buckets(None).await? {
            let stamp = bucket
                .created
                .map_or_else(|| " ".repeat(19), |t| t.format("%Y/%m/%d %H:%M:%S").to_string());
            println!("{stamp}  s3://{}", bucket.name);
        }
        return Ok(Outcome::Done);
    };

    let storage = ctx.resolver.resolve(src).await;
    let recursive = src.is_wildcard() || job.opts.recursive;
    let mut entries = storage.list(src, recursive, None).await?;

    while let Some(item) = entries.next().await {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match item {
            Ok(entry) => {
                if let Some(relative) = relative_for_display(src, &entry) {
                    println!("{}", format_entry(&entry, &relative, &job.opts));
                }
            }
            Err(e) => {
                ctx.counters.add_failed(1);
                tracing::warn!("Skipping unreadable list item: {e}");
            }
        }
    }
    Ok(Outcome::Done)
}

async fn disk_usage(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let storage = ctx.resolver.resolve(src).await;
    let mut entries = storage.list(src, true, None).await?;

    let mut totals: std::collections::BTreeMap<String, (u64, u64)> =
        std::collections::BTreeMap::new();
    while let Some(item) = entries.next().await {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match item {
            Ok(entry) => {
                if entry.is_dir || !expand::entry_matches(src, &entry) {
                    continue;
                }
                let class = if job.opts.group_by_class {
                    entry
                        .storage_class
                        .as_ref()
                        .map_or_else(|| "-".to_string(), ToString::to_string)
                } else {
                    String::new()
                };
                let slot = totals.entry(class).or_insert((0, 0));
                slot.0 += entry.size;
                slot.1 += 1;
            }
            Err(e) => {
                ctx.counters.add_failed(1);
                tracing::warn!("Skipping unreadable list item: {e}");
            }
        }
    }

    for (class, (bytes, count)) in &totals {
        let size = if job.opts.humanize {
            format_size(*bytes, true)
        } else {
            format!("{bytes} bytes")
        };
        let suffix = if class.is_empty() {
            String::new()
        } else {
            format!(" [{class}]")
        };
        println!("{size} in {count} objects: {src}{suffix}");
    }
    Ok(Outcome::Done)
}

async fn make_bucket(ctx: &JobContext, job: &Job) -> Result<Outcome, JobError> {
    let src = job.source();
    let bucket = src
        .as_s3()
        .filter(|s3| s3.is_bucket())
        .ok_or_else(|| {
            JobError::Unsupported(format!("`{src}` is not a bucket location"))
        })?
        .bucket()
        .to_string();

    let storage = ctx.resolver.resolve(src).await;
    storage.make_bucket(&bucket).await?;
    Ok(Outcome::Done)
}

fn required_dest(job: &Job) -> Result<&Location, JobError> {
    job.dest
        .as_ref()
        .ok_or_else(|| JobError::Unsupported(format!("{} requires a destination", job.op)))
}

fn relative_for_display(src: &Location, entry: &ObjectEntry) -> Option<String> {
    match (src, &entry.location) {
        (Location::S3(src), Location::S3(listed)) => src.match_key(listed.key()),
        (Location::Local(src), Location::Local(listed)) => src
            .matches(listed.as_str())
            .then(|| listed.as_str().to_string()),
        _ => None,
    }
}

fn format_entry(entry: &ObjectEntry, relative: &str, opts: &JobOptions) -> String {
    if entry.is_dir {
        return format!("{:>32}  {relative}", "DIR");
    }
    let stamp = entry
        .last_modified
        .map_or_else(|| " ".repeat(19), |t| t.format("%Y/%m/%d %H:%M:%S").to_string());
    let size = format_size(entry.size, opts.humanize);
    if opts.list_etags {
        let etag = entry.etag.as_deref().unwrap_or("-");
        format!("{stamp} {etag:>34} {size:>12}  {relative}")
    } else {
        format!("{stamp} {size:>12}  {relative}")
    }
}

fn format_size(bytes: u64, humanize: bool) -> String {
    if humanize {
        humansize::format_size(bytes, FormatSizeOptions::from(DECIMAL).space_after_value(false))
    } else {
        bytes.to_string()
    }
}
