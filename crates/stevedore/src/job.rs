use stevedore_io::{Location, StorageClass};

/// What a single job does. Batch kinds are expanded at runtime into
/// terminal sub-jobs; terminal kinds are handled directly by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    /// Server-side S3 to S3 copy.
    Copy,
    /// Local file to local file copy.
    LocalCopy,
    /// Remote object to local file.
    Download,
    /// Local file to remote object.
    Upload,
    /// Remote object streamed to stdout.
    Cat,
    /// Delete one remote object.
    Delete,
    /// Delete everything matching the source, batched.
    BatchDelete,
    /// List objects or buckets.
    List,
    /// Accumulate object sizes under a prefix.
    DiskUsage,
    /// Create a bucket.
    MakeBucket,
    /// Expand a wildcard/prefix source into Download sub-jobs.
    BatchDownload,
    /// Walk a local source into Upload sub-jobs.
    BatchUpload,
    /// Expand a wildcard/prefix source into Copy sub-jobs.
    BatchCopy,
    /// Walk a local source into LocalCopy sub-jobs.
    BatchLocalCopy,
}

impl Operation {
    /// Batch operations go through the expander instead of a direct
    /// handler.
    #[must_use]
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            Operation::BatchDownload
                | Operation::BatchUpload
                | Operation::BatchCopy
                | Operation::BatchLocalCopy
                | Operation::BatchDelete
        )
    }

    /// The terminal operation a batch kind expands into.
    #[must_use]
    pub fn expanded(self) -> Operation {
        match self {
            Operation::BatchDownload => Operation::Download,
            Operation::BatchUpload => Operation::Upload,
            Operation::BatchCopy => Operation::Copy,
            Operation::BatchLocalCopy => Operation::LocalCopy,
            other => other,
        }
    }
}

/// Behavior switches recognized by jobs. Storage-class flags from the
/// command line resolve into [`Job::storage_class`] at parse time instead
/// of living here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Remove the source after a successful copy/download/upload (mv).
    pub delete_source: bool,
    /// Skip if the destination already exists.
    pub if_not_exists: bool,
    /// Skip if source and destination sizes match.
    pub if_size_differs: bool,
    /// Skip unless the source is strictly newer than the destination.
    pub if_source_newer: bool,
    /// Reproduce the source hierarchy below the destination.
    pub parents: bool,
    /// Recurse into prefixes/directories when listing.
    pub recursive: bool,
    /// Show ETags in listings.
    pub list_etags: bool,
    /// Human-readable sizes in listings and totals.
    pub humanize: bool,
    /// Group disk-usage totals by storage class.
    pub group_by_class: bool,
}

impl JobOptions {
    /// True if any destination precondition is requested.
    #[must_use]
    pub fn has_conditions(&self) -> bool {
        self.if_not_exists || self.if_size_differs || self.if_source_newer
    }
}

/// One unit of work, owned by a single worker for its lifetime. Batch
/// expansion produces further jobs; they flow through the pool's sub-job
/// channel rather than hanging off their parent.
#[derive(Debug, Clone, PartialEq, typed_builder::TypedBuilder)]
pub struct Job {
    pub op: Operation,
    pub sources: Vec<Location>,
    #[builder(default, setter(strip_option))]
    pub dest: Option<Location>,
    #[builder(default)]
    pub opts: JobOptions,
    #[builder(default, setter(strip_option))]
    pub storage_class: Option<StorageClass>,
}

impl Job {
    /// First (often only) source.
    ///
    /// # Panics
    /// Jobs are constructed with at least one source.
    #[must_use]
    pub fn source(&self) -> &Location {
        self.sources.first().expect("job has at least one source")
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op)?;
        for source in &self.sources {
            write!(f, " {source}")?;
        }
        if let Some(dest) = &self.dest {
            write!(f, " {dest}")?;
        }
        Ok(())
    }
}
