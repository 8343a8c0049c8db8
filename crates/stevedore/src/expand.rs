//! Expansion of batch jobs into terminal sub-jobs.

use async_channel::Sender;
use futures::StreamExt;
use stevedore_io::{Location, ObjectEntry, Storage as _, StorageClass};

use crate::{
    job::{Job, Operation},
    pool::JobContext,
    JobError,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExpansionStats {
    pub enqueued: u64,
    /// Listed items that could not become sub-jobs: unreadable list
    /// entries and Glacier-class objects.
    pub item_failures: u64,
}

/// List the batch job's source and enqueue one terminal sub-job per
/// matching object. Directory markers are skipped, unreadable items are
/// logged and counted, Glacier objects are surfaced as per-item errors for
/// copy and download. Enqueueing honors cancellation.
pub(crate) async fn expand(
    ctx: &JobContext,
    job: &Job,
    sub_tx: &Sender<Job>,
) -> Result<ExpansionStats, JobError> {
    debug_assert!(matches!(
        job.op,
        Operation::BatchDownload
            | Operation::BatchUpload
            | Operation::BatchCopy
            | Operation::BatchLocalCopy
    ));

    let src = job.source();
    let dest = job
        .dest
        .as_ref()
        .ok_or_else(|| JobError::Unsupported(format!("{} requires a destination", job.op)))?;

    let storage = ctx.resolver.resolve(src).await;
    let recursive = src.is_wildcard() || job.opts.recursive;
    let mut entries = storage.list(src, recursive, None).await?;

    let mut stats = ExpansionStats::default();
    while let Some(item) = entries.next().await {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable list item: {e}");
                stats.item_failures += 1;
                continue;
            }
        };
        if entry.is_dir {
            continue;
        }
        if !entry_matches(src, &entry) {
            continue;
        }
        if matches!(job.op, Operation::BatchDownload | Operation::BatchCopy)
            && entry
                .storage_class
                .as_ref()
                .is_some_and(StorageClass::is_glacier)
        {
            tracing::error!(
                "`{}` is a GLACIER object and cannot be retrieved, skipping",
                entry.location
            );
            stats.item_failures += 1;
            continue;
        }

        let sub_dest = dest.join(&derive_relative(src, &entry, job.opts.parents))?;
        let mut sub = Job::builder()
            .op(job.op.expanded())
            .sources(vec![entry.location])
            .dest(sub_dest)
            .opts(job.opts)
            .build();
        sub.storage_class = job.storage_class.clone();

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            sent = sub_tx.send(sub) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        stats.enqueued += 1;
    }

    Ok(stats)
}

pub(crate) fn entry_matches(src: &Location, entry: &ObjectEntry) -> bool {
    match (src, &entry.location) {
        (Location::S3(src), Location::S3(listed)) => src.match_key(listed.key()).is_some(),
        (Location::Local(src), Location::Local(listed)) => src.matches(listed.as_str()),
        // A listing never crosses schemes.
        _ => false,
    }
}

/// Destination path below the batch destination: the source hierarchy from
/// the prefix's final component with `parents`, the bare object name
/// without.
fn derive_relative(src: &Location, entry: &ObjectEntry, parents: bool) -> String {
    if !parents {
        return entry.location.basename();
    }
    match (src, &entry.location) {
        (Location::S3(src), Location::S3(listed)) => src.relative_to_prefix(listed.key()),
        (Location::Local(src), Location::Local(listed)) => {
            src.relative_to_prefix(listed.as_str())
        }
        _ => entry.location.basename(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_entry(key: &str) -> ObjectEntry {
        ObjectEntry::builder()
            .location(Location::parse(format!("s3://b/{key}")).unwrap())
            .build()
    }

    #[test]
    fn test_derive_relative_with_parents_keeps_hierarchy() {
        let src = Location::parse("s3://b/a/b/c/*").unwrap();
        let entry = remote_entry("a/b/c/x/y");
        assert_eq!(derive_relative(&src, &entry, true), "c/x/y");
        assert_eq!(derive_relative(&src, &entry, false), "y");
    }

    #[test]
    fn test_derive_relative_literal_prefix() {
        let src = Location::parse("s3://b/logs/").unwrap();
        let entry = remote_entry("logs/2024/app.log");
        assert_eq!(derive_relative(&src, &entry, true), "logs/2024/app.log");
        assert_eq!(derive_relative(&src, &entry, false), "app.log");
    }

    #[test]
    fn test_wildcard_gate() {
        let src = Location::parse("s3://b/logs/*.gz").unwrap();
        assert!(entry_matches(&src, &remote_entry("logs/a.gz")));
        assert!(!entry_matches(&src, &remote_entry("logs/a.txt")));
        assert!(!entry_matches(&src, &remote_entry("other/a.gz")));
    }
}
