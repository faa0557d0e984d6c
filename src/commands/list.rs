//! Implementation of the `list` command.

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use colored::ColoredString;
use colored::Colorize as _;

use crate::client::HttpJobService;
use crate::client::JobService;
use crate::client::ListQuery;
use crate::commands::CommandError;
use crate::commands::CommandResult;
use crate::config::Config;
use crate::job::JobStatus;
use crate::job::JobSummary;

/// The number of jobs listed by default.
const DEFAULT_LIMIT: u32 = 10;

/// The width of the status column.
const STATUS_WIDTH: usize = 22;

/// Arguments for the `list` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The workspace to list jobs from.
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Only list jobs submitted by this user.
    #[arg(short, long)]
    pub author: Option<String>,

    /// The maximum number of jobs to list.
    #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
    pub limit: u32,

    /// Only list jobs that have not finished.
    #[arg(long)]
    pub running: bool,
}

impl Args {
    /// Builds the listing query, falling back to the configured workspace.
    fn query(&self, config: &Config) -> CommandResult<ListQuery> {
        let workspace = self
            .workspace
            .clone()
            .or_else(|| config.workspace.clone())
            .ok_or_else(|| {
                CommandError::invalid(anyhow!(
                    "a workspace is required; use `--workspace` or set `workspace` in the \
                     configuration"
                ))
            })?;

        Ok(ListQuery {
            workspace,
            author: self.author.clone(),
            limit: Some(self.limit),
            running: self.running,
        })
    }
}

/// Colors a job's status for display.
fn colored_status(status: JobStatus) -> ColoredString {
    let text = format!("{status:<STATUS_WIDTH$}");
    match status {
        JobStatus::Pending => text.yellow(),
        JobStatus::Running => text.cyan(),
        JobStatus::Succeeded => text.green(),
        JobStatus::Failed { .. } | JobStatus::Preempted | JobStatus::Canceled => text.red(),
    }
}

/// Renders a row of the job listing.
fn row(job: &JobSummary, name_width: usize) -> String {
    format!(
        "{created}  {status}  {name:<name_width$}  {id}  {author}",
        created = job.created.format("%Y-%m-%d %H:%M"),
        status = colored_status(job.status),
        name = job.handle.name,
        id = job.handle.id,
        author = job.author,
    )
}

/// Lists jobs matching the query.
pub async fn list_jobs<S>(service: &S, query: &ListQuery) -> anyhow::Result<Vec<JobSummary>>
where
    S: JobService + ?Sized,
{
    let mut jobs = service.list(query).await.with_context(|| {
        format!(
            "failed to list jobs in workspace `{workspace}`",
            workspace = query.workspace
        )
    })?;

    if query.running {
        jobs.retain(|job| !job.status.is_terminal());
    }

    if let Some(limit) = query.limit {
        jobs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }

    Ok(jobs)
}

/// The main function for the `list` command.
pub async fn list(args: Args, config: Config) -> CommandResult {
    let query = args.query(&config)?;
    let service = HttpJobService::new(&config.service)?;
    let jobs = list_jobs(&service, &query).await?;

    if jobs.is_empty() {
        eprintln!(
            "no jobs found in workspace `{workspace}`",
            workspace = query.workspace
        );
        return Ok(());
    }

    let name_width = jobs
        .iter()
        .map(|job| job.handle.name.len())
        .max()
        .unwrap_or_default();
    for job in &jobs {
        println!("{}", row(job, name_width));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::JobHandle;

    fn summary(name: &str, status: JobStatus) -> JobSummary {
        JobSummary {
            handle: JobHandle {
                id: format!("{name}-id"),
                name: name.to_string(),
                url: None,
            },
            author: "petew".to_string(),
            status,
            created: Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn workspace_falls_back_to_the_configuration() {
        let args = Args::try_parse_from(["list"]).unwrap();
        let e = args.query(&Config::default()).unwrap_err();
        assert_eq!(e.exit_code(), 2);

        let config = Config {
            workspace: Some("ai2/example".to_string()),
            ..Default::default()
        };
        let query = args.query(&config).unwrap();
        assert_eq!(query.workspace, "ai2/example");
        assert_eq!(query.limit, Some(DEFAULT_LIMIT));

        let args =
            Args::try_parse_from(["list", "-w", "ai2/other", "--author", "petew", "--running"])
                .unwrap();
        let query = args.query(&config).unwrap();
        assert_eq!(query.workspace, "ai2/other");
        assert_eq!(query.author.as_deref(), Some("petew"));
        assert!(query.running);
    }

    #[test]
    fn rows_align_names() {
        colored::control::set_override(false);
        let row = row(&summary("train", JobStatus::Running), 8);
        assert_eq!(
            row,
            format!(
                "2025-06-01 12:30  {status:<STATUS_WIDTH$}  train     train-id  petew",
                status = "running"
            )
        );
    }
}
