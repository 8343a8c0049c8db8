#![forbid(unsafe_code)]

use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser as _;
use stevedore::{EngineConfig, PoolParams, RunSummary, StorageResolver, WorkerPool};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.log_level.as_deref(), cli.global.json);

    match run(cli).await {
        Ok(summary) => {
            tracing::info!(
                "done: {} completed, {} skipped, {} failed",
                summary.completed,
                summary.skipped,
                summary.failed
            );
            if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<RunSummary> {
    let mut config = EngineConfig::load().map_err(|e| anyhow::anyhow!(e))?;
    if let Some(workers) = cli.global.workers {
        config.workers = workers;
    }
    if let Some(endpoint) = cli.global.endpoint_url.clone() {
        config.endpoint_url = Some(endpoint);
    }
    if let Some(region) = cli.global.region.clone() {
        config.region = Some(region);
    }
    if cli.global.path_style {
        config.path_style_access = true;
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let resolver = StorageResolver::new(config.s3_settings(), None);
    let pool = WorkerPool::new(resolver, &PoolParams::from(&config), cancel);

    match cli.command {
        Command::Run { file } => {
            let parse_failures = Arc::new(AtomicU64::new(0));
            let jobs = command_stream(&file, Arc::clone(&parse_failures)).await?;
            let mut summary = pool.run_stream(jobs).await;
            summary.failed += parse_failures.load(Ordering::Relaxed);
            Ok(summary)
        }
        command => {
            let job = cli::to_job(command)?;
            Ok(pool.run(job).await)
        }
    }
}

/// Stream jobs out of a newline-delimited command file. Unparsable lines
/// are logged and counted as failures without stopping the stream.
async fn command_stream(
    file: &str,
    parse_failures: Arc<AtomicU64>,
) -> anyhow::Result<impl futures::Stream<Item = stevedore::Job>> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = if file == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(file)
                .await
                .with_context(|| format!("could not open command file `{file}`"))?,
        )
    };

    let mut lines = BufReader::new(reader).lines();
    Ok(async_stream::stream! {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("could not read command input: {e}");
                    parse_failures.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match cli::parse_line(trimmed) {
                Ok(job) => yield job,
                Err(e) => {
                    tracing::error!("invalid command `{trimmed}`: {e}");
                    parse_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    })
}

fn init_tracing(filter: Option<&str>, json: bool) {
    use tracing_subscriber::EnvFilter;

    let env_filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
