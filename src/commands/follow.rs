//! Implementation of the `follow` command.

use std::io::stdout;

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use tokio::select;

use crate::callbacks::Callbacks;
use crate::client::HttpJobService;
use crate::client::JobService;
use crate::commands::CommandError;
use crate::commands::CommandResult;
use crate::config::Config;
use crate::job::JobInfo;
use crate::job::JobStatus;
use crate::launch;
use crate::launch::FollowOptions;
use crate::launch::shutdown_signal;
use crate::launch::summarize;

/// Arguments for the `follow` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The ID or name of the job to follow.
    #[arg(value_name = "JOB")]
    pub job: String,

    /// Only show the last lines of the existing log before following.
    #[arg(short, long)]
    pub tail: bool,

    /// A Slack incoming webhook to notify about the job.
    #[arg(long, value_name = "URL")]
    pub slack_webhook_url: Option<String>,
}

/// Prints a summary of a finished job.
///
/// Returns an error carrying the job's exit code unless it succeeded.
pub fn report(info: &JobInfo) -> CommandResult {
    println!("{}", summarize(info));
    match info.status {
        JobStatus::Succeeded => Ok(()),
        status => Err(CommandError::Job {
            name: info.handle.name.clone(),
            status,
        }),
    }
}

/// Follows a job by ID or name, writing its log to standard output.
///
/// Interrupting the command stops following but leaves the job running.
pub async fn follow_job<S>(service: &S, args: &Args, options: FollowOptions) -> CommandResult
where
    S: JobService + ?Sized,
{
    let job = service
        .job(&args.job)
        .await
        .with_context(|| format!("failed to find job `{job}`", job = args.job))?;

    let options = FollowOptions {
        tail: args.tail,
        ..options
    };

    if job.status.is_terminal() {
        let (lines, _) = launch::backlog(
            service,
            &job.handle.id,
            if args.tail { launch::TAIL_LINES } else { usize::MAX },
        )
        .await
        .context("failed to read the job's log")?;
        for line in lines {
            println!("{message}", message = line.message);
        }
        return report(&job);
    }

    eprintln!("following job {handle}", handle = job.handle);
    let mut out = stdout();
    let info = select! {
        biased;

        _ = shutdown_signal() => {
            return Err(anyhow!(
                "interrupted; job `{name}` is still running",
                name = job.handle.name
            )
            .into());
        }
        res = launch::follow(service, &job.handle, &options, &mut out) => {
            res.map_err(anyhow::Error::from)?
        }
    };

    report(&info)
}

/// The main function for the `follow` command.
pub async fn follow(args: Args, config: Config) -> CommandResult {
    let service = HttpJobService::new(&config.service)?;
    let mut options = FollowOptions::new(config.follow.poll_interval());
    options.callbacks = Callbacks::configured(args.slack_webhook_url.as_deref(), &config.follow)
        .map_err(CommandError::invalid)?;
    follow_job(&service, &args, options).await
}
