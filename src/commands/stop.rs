//! Implementation of the `stop` command.

use anyhow::anyhow;
use clap::Parser;
use tracing::warn;

use crate::client::ClientError;
use crate::client::HttpJobService;
use crate::client::JobService;
use crate::commands::CommandResult;
use crate::config::Config;

/// Arguments for the `stop` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The IDs or names of the jobs to stop.
    #[arg(value_name = "JOB", required = true)]
    pub jobs: Vec<String>,

    /// Show the jobs that would be stopped without stopping them.
    #[arg(long)]
    pub dry_run: bool,
}

/// What happened to a job asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job was canceled.
    Stopped(String),
    /// The job would have been canceled.
    WouldStop(String),
    /// The job had already finished.
    Finished(String),
    /// No such job exists.
    NotFound(String),
}

/// Stops the given jobs.
///
/// Jobs that cannot be found are skipped; any other service failure aborts.
pub async fn stop_jobs<S>(service: &S, args: &Args) -> Result<Vec<Outcome>, ClientError>
where
    S: JobService + ?Sized,
{
    let mut outcomes = Vec::with_capacity(args.jobs.len());
    for job in &args.jobs {
        let info = match service.job(job).await {
            Ok(info) => info,
            Err(ClientError::NotFound { .. }) => {
                warn!("job `{job}` was not found");
                outcomes.push(Outcome::NotFound(job.clone()));
                continue;
            }
            Err(e) => return Err(e),
        };

        let handle = info.handle.to_string();
        if info.status.is_terminal() {
            outcomes.push(Outcome::Finished(handle));
        } else if args.dry_run {
            outcomes.push(Outcome::WouldStop(handle));
        } else {
            service.cancel(&info.handle.id).await?;
            outcomes.push(Outcome::Stopped(handle));
        }
    }

    Ok(outcomes)
}

/// The main function for the `stop` command.
pub async fn stop(args: Args, config: Config) -> CommandResult {
    let service = HttpJobService::new(&config.service)?;
    let outcomes = stop_jobs(&service, &args)
        .await
        .map_err(anyhow::Error::from)?;

    let mut missing = 0;
    for outcome in outcomes {
        match outcome {
            Outcome::Stopped(job) => println!("stopped job {job}"),
            Outcome::WouldStop(job) => println!("would stop job {job}"),
            Outcome::Finished(job) => println!("job {job} already finished"),
            Outcome::NotFound(_) => missing += 1,
        }
    }

    if missing == args.jobs.len() {
        return Err(anyhow!("none of the given jobs were found").into());
    }

    Ok(())
}
