#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(clippy::module_name_repetitions)]
#![forbid(unsafe_code)]

//! The stevedore transfer engine: a worker pool executing copy, transfer,
//! and deletion jobs against the storage capability, with runtime batch
//! expansion and ordered reassembly of parallel downloads.

pub mod client;
pub mod condition;
pub mod config;
mod contenttype;
pub mod delete;
mod expand;
mod handler;
pub mod job;
pub mod ordered;
pub mod pool;

pub use client::StorageResolver;
pub use config::EngineConfig;
pub use job::{Job, JobOptions, Operation};
pub use ordered::OrderedWriter;
pub use pool::{PoolParams, RunSummary, WorkerPool, POLL_INTERVAL};

/// Failure of a single job. Batch siblings are unaffected; the pool counts
/// and logs it.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    InvalidLocation(#[from] stevedore_io::InvalidLocationError),
    #[error(transparent)]
    Stat(#[from] stevedore_io::StatError),
    #[error(transparent)]
    Read(#[from] stevedore_io::ReadError),
    #[error(transparent)]
    Write(#[from] stevedore_io::WriteError),
    #[error(transparent)]
    Delete(#[from] stevedore_io::DeleteError),
    #[error(transparent)]
    BatchDelete(#[from] stevedore_io::DeleteBatchFatalError),
    #[error(transparent)]
    Storage(#[from] stevedore_io::IOError),
    #[error("Local I/O failed: {0}")]
    LocalIo(#[from] std::io::Error),
    #[error("{0}")]
    Unsupported(String),
}
