//! Submitting jobs and following them to completion.

use std::collections::VecDeque;
use std::io::Write;
use std::pin::pin;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::select;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::callbacks::Callbacks;
use crate::callbacks::JobEvent;
use crate::client::ClientError;
use crate::client::JobService;
use crate::client::stream_logs;
use crate::client::with_retries;
use crate::job::JobHandle;
use crate::job::JobInfo;
use crate::job::JobRequest;
use crate::job::LogLine;
use crate::names::random_suffix;

/// The number of name conflicts after which longer suffixes are used.
const LONG_SUFFIX_AFTER: u32 = 5;

/// The number of name conflicts tolerated before submission fails.
const MAX_NAME_CONFLICTS: u32 = 20;

/// The number of backlog lines shown when tailing a job.
pub const TAIL_LINES: usize = 10;

/// Submits a job, adding a random suffix to its name until it is unique.
///
/// Suffixes are four hex digits at first and seven once the name has
/// conflicted five times.
pub async fn submit_unique<S>(
    service: &S,
    name: &str,
    request: &JobRequest,
) -> Result<JobHandle, ClientError>
where
    S: JobService + ?Sized,
{
    let mut candidate = name.to_string();
    let mut conflicts = 0;
    loop {
        match service.submit(&candidate, request).await {
            Err(ClientError::Conflict(_)) if conflicts < MAX_NAME_CONFLICTS => {
                conflicts += 1;
                if conflicts == LONG_SUFFIX_AFTER {
                    warn!("many jobs named `{name}` already exist; consider using a different name");
                }

                let len = if conflicts < LONG_SUFFIX_AFTER { 4 } else { 7 };
                candidate = format!("{name}-{suffix}", suffix = random_suffix(len));
                debug!(name = %candidate, "job name is taken; retrying with a new name");
            }
            res => return res,
        }
    }
}

/// Options for following a job.
#[derive(Debug, Clone)]
pub struct FollowOptions {
    /// Whether the job's log is streamed.
    pub show_logs: bool,
    /// How long to wait for the job to finish.
    pub timeout: Option<Duration>,
    /// How long to wait for the job to start.
    pub start_timeout: Option<Duration>,
    /// How long to wait for new log lines.
    pub inactive_timeout: Option<Duration>,
    /// Whether the job is canceled when a timeout expires.
    pub auto_cancel: bool,
    /// Whether only the end of the existing log is shown.
    pub tail: bool,
    /// The interval between polls of the job's state.
    pub poll_interval: Duration,
    /// The callbacks told about the job's events.
    pub callbacks: Callbacks,
}

impl FollowOptions {
    /// Creates options that stream the whole log without timeouts.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            show_logs: true,
            timeout: None,
            start_timeout: None,
            inactive_timeout: None,
            auto_cancel: false,
            tail: false,
            poll_interval,
            callbacks: Callbacks::new(),
        }
    }
}

/// Represents an error while following a job.
#[derive(Debug, Error)]
pub enum FollowError {
    /// The job did not start in time.
    #[error("timed out after {}s waiting for the job to start", .0.as_secs())]
    StartTimeout(Duration),
    /// The job produced no output in time.
    #[error("timed out after {}s waiting for the job to produce more output", .0.as_secs())]
    Inactive(Duration),
    /// The job did not finish in time.
    #[error("timed out after {}s waiting for the job to finish", .0.as_secs())]
    Timeout(Duration),
    /// Following was interrupted locally.
    #[error("interrupted while following the job")]
    Interrupted,
    /// The job service failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The job's output could not be written.
    #[error("failed to write the job's output")]
    Io(#[from] std::io::Error),
}

impl FollowError {
    /// Determines if the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::StartTimeout(_) | Self::Inactive(_) | Self::Timeout(_)
        )
    }
}

/// Follows a job until it finishes, writing its log to `out`.
///
/// The options' callbacks are told when the job starts, when it finishes, and
/// when a timeout expires.
pub async fn follow<S, W>(
    service: &S,
    job: &JobHandle,
    options: &FollowOptions,
    out: &mut W,
) -> Result<JobInfo, FollowError>
where
    S: JobService + ?Sized,
    W: Write,
{
    let id = job.id.as_str();
    let following = async {
        wait_for_start(service, id, options).await?;
        options.callbacks.notify(job, JobEvent::Started).await;
        if options.show_logs {
            write_log(service, id, options, out).await?;
        }
        wait_for_finish(service, id, options.poll_interval).await
    };

    let result = match options.timeout {
        Some(limit) => timeout(limit, following)
            .await
            .unwrap_or(Err(FollowError::Timeout(limit))),
        None => following.await,
    };

    let event = match &result {
        Ok(info) => JobEvent::finished(info.status),
        Err(FollowError::StartTimeout(_)) => Some(JobEvent::StartTimeout),
        Err(FollowError::Inactive(_)) => Some(JobEvent::InactiveTimeout),
        Err(FollowError::Timeout(_)) => Some(JobEvent::Timeout),
        Err(_) => None,
    };
    if let Some(event) = event {
        options.callbacks.notify(job, event).await;
    }

    result
}

/// Follows a job until it finishes or `shutdown` resolves.
///
/// The job is canceled when `shutdown` resolves first, and when a timeout
/// expires if the options ask for it.
pub async fn attach<S, W, F>(
    service: &S,
    handle: &JobHandle,
    options: &FollowOptions,
    out: &mut W,
    shutdown: F,
) -> Result<JobInfo, FollowError>
where
    S: JobService + ?Sized,
    W: Write,
    F: Future<Output = ()>,
{
    let result = select! {
        // Prefer the shutdown signal to the job finishing.
        biased;

        _ = shutdown => Err(FollowError::Interrupted),
        res = follow(service, handle, options, out) => res,
    };

    match result {
        Err(e) if matches!(e, FollowError::Interrupted) || (e.is_timeout() && options.auto_cancel) => {
            warn!("{e}; canceling job `{name}`", name = handle.name);
            service.cancel(&handle.id).await?;
            info!("job `{name}` was canceled", name = handle.name);
            options.callbacks.notify(handle, JobEvent::Canceled).await;
            Err(e)
        }
        res => res,
    }
}

/// Waits for a job to start.
async fn wait_for_start<S>(service: &S, id: &str, options: &FollowOptions) -> Result<(), FollowError>
where
    S: JobService + ?Sized,
{
    let started = async {
        loop {
            let info = with_retries(|| service.job(id)).await?;
            if info.status.has_started() {
                return Ok::<_, FollowError>(());
            }

            sleep(options.poll_interval).await;
        }
    };

    info!("waiting for the job to start");
    match options.start_timeout {
        Some(limit) => timeout(limit, started)
            .await
            .map_err(|_| FollowError::StartTimeout(limit))?,
        None => started.await,
    }
}

/// Waits for a job to finish.
async fn wait_for_finish<S>(service: &S, id: &str, poll: Duration) -> Result<JobInfo, FollowError>
where
    S: JobService + ?Sized,
{
    loop {
        let info = with_retries(|| service.job(id)).await?;
        if info.status.is_terminal() {
            return Ok(info);
        }

        sleep(poll).await;
    }
}

/// Reads the existing log, keeping only its last `keep` lines.
///
/// Returns the kept lines and the offset following the last line read.
pub async fn backlog<S>(
    service: &S,
    id: &str,
    keep: usize,
) -> Result<(VecDeque<LogLine>, u64), ClientError>
where
    S: JobService + ?Sized,
{
    let mut lines = VecDeque::new();
    let mut offset = 0;
    loop {
        let chunk = with_retries(|| service.logs(id, offset)).await?;
        if chunk.lines.is_empty() || chunk.next_offset <= offset {
            return Ok((lines, offset));
        }

        offset = chunk.next_offset;
        for line in chunk.lines {
            lines.push_back(line);
            if lines.len() > keep {
                lines.pop_front();
            }
        }
    }
}

/// Writes a job's log to `out` until the job finishes.
async fn write_log<S, W>(
    service: &S,
    id: &str,
    options: &FollowOptions,
    out: &mut W,
) -> Result<(), FollowError>
where
    S: JobService + ?Sized,
    W: Write,
{
    let offset = if options.tail {
        let (lines, offset) = backlog(service, id, TAIL_LINES).await?;
        for line in lines {
            writeln!(out, "{message}", message = line.message)?;
        }
        offset
    } else {
        0
    };

    let mut lines = pin!(stream_logs(service, id, offset, options.poll_interval));
    loop {
        let next = match options.inactive_timeout {
            Some(limit) => timeout(limit, lines.next())
                .await
                .map_err(|_| FollowError::Inactive(limit))?,
            None => lines.next().await,
        };

        match next {
            Some(line) => {
                writeln!(out, "{message}", message = line?.message)?;
                out.flush()?;
            }
            None => return Ok(()),
        }
    }
}

/// Resolves when the process is asked to stop.
///
/// This is an interrupt (Ctrl-C) or, on Unix, `SIGTERM`.
pub async fn shutdown_signal() {
    /// Waits for an interrupt, never resolving if one cannot be awaited.
    async fn interrupt() {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        select! {
            _ = interrupt() => {}
            _ = terminate => {}
        }
    }

    #[cfg(not(unix))]
    interrupt().await;
}

/// Formats a duration as hours, minutes, and seconds.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}

/// Summarizes a finished job for display.
pub fn summarize(info: &JobInfo) -> String {
    let mut summary = format!(
        "job {handle} {status}",
        handle = info.handle,
        status = info.status
    );

    if let Some(dataset) = &info.result_dataset {
        summary.push_str(&format!("\nresults: {dataset}"));
    }

    if let (Some(started), Some(finished)) = (info.started, info.finished)
        && let Ok(runtime) = (finished - started).to_std()
    {
        summary.push_str(&format!("\nruntime: {}", format_duration(runtime)));
    }

    summary
}
