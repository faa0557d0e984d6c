//! Implementation of the `logs` command.

use std::io::Write;
use std::io::stdout;
use std::pin::pin;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;

use crate::client::HttpJobService;
use crate::client::JobService;
use crate::client::stream_logs;
use crate::commands::CommandResult;
use crate::config::Config;
use crate::launch::backlog;

/// Arguments for the `logs` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The ID or name of the job.
    #[arg(value_name = "JOB")]
    pub job: String,

    /// Only show the last N lines of the log.
    #[arg(short, long, value_name = "N")]
    pub tail: Option<usize>,

    /// Keep printing new lines until the job finishes.
    #[arg(short, long)]
    pub follow: bool,
}

/// Writes a job's log to `out`.
pub async fn write_logs<S, W>(
    service: &S,
    args: &Args,
    poll_interval: std::time::Duration,
    out: &mut W,
) -> anyhow::Result<()>
where
    S: JobService + ?Sized,
    W: Write,
{
    let job = service
        .job(&args.job)
        .await
        .with_context(|| format!("failed to find job `{job}`", job = args.job))?;

    let (lines, offset) = backlog(service, &job.handle.id, args.tail.unwrap_or(usize::MAX))
        .await
        .context("failed to read the job's log")?;
    for line in lines {
        writeln!(out, "{message}", message = line.message)?;
    }

    if !args.follow {
        return Ok(());
    }

    let mut lines = pin!(stream_logs(service, &job.handle.id, offset, poll_interval));
    while let Some(line) = lines.next().await {
        let line = line.context("failed to read the job's log")?;
        writeln!(out, "{message}", message = line.message)?;
        out.flush()?;
    }

    Ok(())
}

/// The main function for the `logs` command.
pub async fn logs(args: Args, config: Config) -> CommandResult {
    let service = HttpJobService::new(&config.service)?;
    write_logs(
        &service,
        &args,
        config.follow.poll_interval(),
        &mut stdout(),
    )
    .await?;
    Ok(())
}
