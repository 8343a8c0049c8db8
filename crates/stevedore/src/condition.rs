//! Destination precondition checks for copy, upload, and download.

use stevedore_io::{Location, StatError, Storage, StorageBackend};

use crate::job::JobOptions;

/// Outcome of a precondition check. A skip is surfaced with its reason but
/// does not count as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Skip(&'static str),
}

/// Decide whether a transfer to `dst` should run.
///
/// The three predicates are evaluated in a fixed order, each either setting
/// the skip result or clearing it, so the last applicable predicate wins. A
/// destination that does not exist always proceeds.
///
/// # Errors
/// Any stat failure other than destination-not-found.
pub async fn check(
    src_storage: &StorageBackend,
    dst_storage: &StorageBackend,
    src: &Location,
    dst: &Location,
    opts: &JobOptions,
) -> Result<Decision, StatError> {
    if !opts.has_conditions() {
        return Ok(Decision::Proceed);
    }

    let dst_entry = match dst_storage.stat(dst).await {
        Ok(entry) => entry,
        Err(e) if e.is_not_found() => return Ok(Decision::Proceed),
        Err(e) => return Err(e),
    };
    let src_entry = src_storage.stat(src).await?;

    let mut decision = Decision::Proceed;
    if opts.if_not_exists {
        decision = Decision::Skip("object already exists");
    }
    if opts.if_size_differs {
        decision = if src_entry.size == dst_entry.size {
            Decision::Skip("size matches")
        } else {
            Decision::Proceed
        };
    }
    if opts.if_source_newer {
        // `None` mtimes sort lowest, so an unknown source age never counts
        // as newer. Equal timestamps are not newer either.
        decision = if src_entry.last_modified > dst_entry.last_modified {
            Decision::Proceed
        } else {
            Decision::Skip("destination is newer or same age")
        };
    }
    Ok(decision)
}
