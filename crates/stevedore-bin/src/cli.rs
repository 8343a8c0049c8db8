//! Command surface and translation into engine jobs.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use stevedore::{Job, JobOptions, Operation};
use stevedore_io::{Location, StorageClass};

#[derive(Debug, Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Parallel data mover between local filesystems and S3-compatible object stores"
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct GlobalArgs {
    /// Number of parallel workers
    #[arg(long, global = true)]
    pub(crate) workers: Option<usize>,

    /// Custom S3-compatible endpoint, e.g. http://localhost:9000
    #[arg(long, global = true)]
    pub(crate) endpoint_url: Option<url::Url>,

    /// AWS region
    #[arg(long, global = true)]
    pub(crate) region: Option<String>,

    /// Use path-style bucket addressing (most non-AWS endpoints)
    #[arg(long, global = true)]
    pub(crate) path_style: bool,

    /// Log filter, e.g. `info` or `stevedore=debug` (overrides RUST_LOG)
    #[arg(long, global = true)]
    pub(crate) log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub(crate) json: bool,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Copy objects or files
    ///
    /// Sources may carry `*` and `?` wildcards; wildcard and directory
    /// sources expand into one transfer per matching object.
    #[command(name = "cp")]
    Copy(TransferArgs),

    /// Move: copy, then delete the source
    #[command(name = "mv")]
    Move(TransferArgs),

    /// Remove objects or files
    #[command(name = "rm")]
    Remove {
        /// Targets; a single wildcard expands server-side
        #[arg(required = true)]
        urls: Vec<String>,
        /// Expand a literal prefix recursively
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// List buckets, or objects under a URL
    #[command(name = "ls")]
    List {
        url: Option<String>,
        /// Show ETags
        #[arg(short = 'e', long)]
        etags: bool,
        /// Human-readable sizes
        #[arg(short = 'H', long)]
        humanize: bool,
        /// Recurse below the prefix
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Stream a remote object to stdout
    #[command(name = "cat")]
    Cat { url: String },

    /// Total size and object count under a prefix
    #[command(name = "du")]
    DiskUsage {
        url: String,
        /// Group totals by storage class
        #[arg(short = 'g', long)]
        group: bool,
        /// Human-readable sizes
        #[arg(short = 'H', long)]
        humanize: bool,
    },

    /// Create a bucket
    #[command(name = "mb")]
    MakeBucket { bucket: String },

    /// Execute commands from a file, one per line (`-` for stdin)
    #[command(name = "run")]
    Run { file: String },
}

#[derive(Debug, Clone, Args)]
pub(crate) struct TransferArgs {
    pub(crate) src: String,
    pub(crate) dst: String,

    /// Skip when the destination already exists
    #[arg(short = 'n', long)]
    pub(crate) if_not_exists: bool,

    /// Skip when source and destination sizes match
    #[arg(short = 's', long)]
    pub(crate) if_size_differs: bool,

    /// Skip unless the source is strictly newer
    #[arg(short = 'u', long)]
    pub(crate) if_source_newer: bool,

    /// Recreate the source hierarchy below the destination
    #[arg(long)]
    pub(crate) parents: bool,

    /// Recurse into directories and prefixes
    #[arg(short = 'R', long)]
    pub(crate) recursive: bool,

    /// Store with the REDUCED_REDUNDANCY class
    #[arg(long, conflicts_with = "infrequent_access")]
    pub(crate) reduced_redundancy: bool,

    /// Store with the STANDARD_IA class
    #[arg(long)]
    pub(crate) infrequent_access: bool,
}

/// One line of a `run` input file, parsed through the same grammar as the
/// command line.
#[derive(Debug, Parser)]
#[command(name = "stevedore")]
struct Line {
    #[command(subcommand)]
    command: Command,
}

/// Parse a text command line (from `run` input) into a job.
pub(crate) fn parse_line(line: &str) -> anyhow::Result<Job> {
    let tokens = std::iter::once("stevedore").chain(line.split_whitespace());
    let parsed = Line::try_parse_from(tokens)?;
    if matches!(parsed.command, Command::Run { .. }) {
        bail!("`run` cannot be nested");
    }
    to_job(parsed.command)
}

/// Translate a parsed command into the engine's job value.
pub(crate) fn to_job(command: Command) -> anyhow::Result<Job> {
    match command {
        Command::Copy(args) => transfer_job(&args, false),
        Command::Move(args) => transfer_job(&args, true),
        Command::Remove { urls, recursive } => {
            let sources = urls
                .iter()
                .map(Location::parse)
                .collect::<Result<Vec<_>, _>>()
                .context("invalid remove target")?;
            let op = if sources.len() == 1 && !sources[0].is_wildcard() && !recursive {
                match &sources[0] {
                    Location::S3(_) => Operation::Delete,
                    Location::Local(_) => Operation::BatchDelete,
                }
            } else {
                Operation::BatchDelete
            };
            Ok(Job::builder()
                .op(op)
                .sources(sources)
                .opts(JobOptions {
                    recursive,
                    ..JobOptions::default()
                })
                .build())
        }
        Command::List {
            url,
            etags,
            humanize,
            recursive,
        } => {
            let sources = match url {
                Some(url) => {
                    let location = Location::parse(&url).context("invalid list source")?;
                    if location.is_local() {
                        bail!("`ls` lists remote locations; got `{url}`");
                    }
                    vec![location]
                }
                None => Vec::new(),
            };
            Ok(Job::builder()
                .op(Operation::List)
                .sources(sources)
                .opts(JobOptions {
                    list_etags: etags,
                    humanize,
                    recursive,
                    ..JobOptions::default()
                })
                .build())
        }
        Command::Cat { url } => {
            let location = Location::parse(&url).context("invalid cat source")?;
            if !location.is_remote() || location.is_wildcard() {
                bail!("`cat` takes a single remote object");
            }
            Ok(Job::builder()
                .op(Operation::Cat)
                .sources(vec![location])
                .build())
        }
        Command::DiskUsage {
            url,
            group,
            humanize,
        } => {
            let location = Location::parse(&url).context("invalid du source")?;
            Ok(Job::builder()
                .op(Operation::DiskUsage)
                .sources(vec![location])
                .opts(JobOptions {
                    group_by_class: group,
                    humanize,
                    ..JobOptions::default()
                })
                .build())
        }
        Command::MakeBucket { bucket } => {
            let location = Location::parse(&bucket).context("invalid bucket")?;
            Ok(Job::builder()
                .op(Operation::MakeBucket)
                .sources(vec![location])
                .build())
        }
        Command::Run { .. } => bail!("`run` is driven by the main loop, not a job"),
    }
}

fn transfer_job(args: &TransferArgs, delete_source: bool) -> anyhow::Result<Job> {
    let src = Location::parse(&args.src).context("invalid source")?;
    let dst = Location::parse(&args.dst).context("invalid destination")?;
    if dst.is_wildcard() {
        bail!("destination cannot contain wildcards");
    }

    let batch = src.is_wildcard() || args.recursive || is_local_dir(&src);
    let op = match (&src, &dst, batch) {
        (Location::S3(_), Location::S3(_), false) => Operation::Copy,
        (Location::S3(_), Location::S3(_), true) => Operation::BatchCopy,
        (Location::S3(_), Location::Local(_), false) => Operation::Download,
        (Location::S3(_), Location::Local(_), true) => Operation::BatchDownload,
        (Location::Local(_), Location::S3(_), false) => Operation::Upload,
        (Location::Local(_), Location::S3(_), true) => Operation::BatchUpload,
        (Location::Local(_), Location::Local(_), false) => Operation::LocalCopy,
        (Location::Local(_), Location::Local(_), true) => Operation::BatchLocalCopy,
    };

    let storage_class = if args.reduced_redundancy {
        Some(StorageClass::ReducedRedundancy)
    } else if args.infrequent_access {
        Some(StorageClass::StandardIa)
    } else {
        None
    };

    let mut job = Job::builder()
        .op(op)
        .sources(vec![src])
        .dest(dst)
        .opts(JobOptions {
            delete_source,
            if_not_exists: args.if_not_exists,
            if_size_differs: args.if_size_differs,
            if_source_newer: args.if_source_newer,
            parents: args.parents,
            recursive: args.recursive,
            ..JobOptions::default()
        })
        .build();
    job.storage_class = storage_class;
    Ok(job)
}

fn is_local_dir(location: &Location) -> bool {
    location
        .as_local()
        .is_some_and(|local| !local.is_wildcard() && local.path().is_dir())
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use pretty_assertions::assert_eq;

    use super::*;

    fn job_of(line: &str) -> Job {
        parse_line(line).unwrap()
    }

    #[test]
    fn test_cp_classification() {
        assert_eq!(job_of("cp s3://b/a s3://b/c").op, Operation::Copy);
        assert_eq!(job_of("cp s3://b/a/* s3://b/c/").op, Operation::BatchCopy);
        assert_eq!(job_of("cp s3://b/a out.bin").op, Operation::Download);
        assert_eq!(job_of("cp s3://b/a/* out/").op, Operation::BatchDownload);
        assert_eq!(job_of("cp in.bin s3://b/a").op, Operation::Upload);
        assert_eq!(job_of("cp one.bin two.bin").op, Operation::LocalCopy);
    }

    #[test]
    fn test_local_dir_source_becomes_batch_upload() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!("cp {} s3://b/up/", dir.path().display());
        assert_eq!(job_of(&line).op, Operation::BatchUpload);
    }

    #[test]
    fn test_mv_sets_delete_source() {
        let job = job_of("mv s3://b/a s3://b/c");
        assert!(job.opts.delete_source);
        assert_eq!(job.op, Operation::Copy);
    }

    #[test]
    fn test_transfer_flags() {
        let job = job_of("cp -n -s -u --parents s3://b/a/* out/");
        assert!(job.opts.if_not_exists);
        assert!(job.opts.if_size_differs);
        assert!(job.opts.if_source_newer);
        assert!(job.opts.parents);
    }

    #[test]
    fn test_storage_class_flags() {
        let job = job_of("cp --infrequent-access in.bin s3://b/a");
        assert_eq!(job.storage_class, Some(StorageClass::StandardIa));
        assert!(parse_line("cp --infrequent-access --reduced-redundancy a s3://b/a").is_err());
    }

    #[test]
    fn test_rm_classification() {
        assert_eq!(job_of("rm s3://b/one").op, Operation::Delete);
        assert_eq!(job_of("rm s3://b/*.tmp").op, Operation::BatchDelete);
        assert_eq!(job_of("rm s3://b/one s3://b/two").op, Operation::BatchDelete);
        assert_eq!(job_of("rm -R s3://b/prefix/").op, Operation::BatchDelete);
    }

    #[test]
    fn test_ls_variants() {
        let buckets = job_of("ls");
        assert_eq!(buckets.op, Operation::List);
        assert!(buckets.sources.is_empty());

        let objects = job_of("ls -e -H s3://b/pre/");
        assert!(objects.opts.list_etags);
        assert!(objects.opts.humanize);
    }

    #[test]
    fn test_invalid_lines_are_rejected() {
        assert!(parse_line("cat s3://b/a/*").is_err());
        assert!(parse_line("cp s3://b/a s3://b/out/*").is_err());
        assert!(parse_line("frobnicate x").is_err());
        assert!(parse_line("run more.txt").is_err());
        assert!(parse_line("cp s3://buck*t/a out").is_err());
    }

    #[test]
    fn test_global_flags_parse() {
        let cli = Cli::parse_from([
            "stevedore",
            "--workers",
            "16",
            "--endpoint-url",
            "http://localhost:9000",
            "--path-style",
            "ls",
        ]);
        assert_eq!(cli.global.workers, Some(16));
        assert!(cli.global.path_style);
    }
}
