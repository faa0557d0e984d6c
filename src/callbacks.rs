//! Notifications about followed jobs.
//!
//! A [`Callback`] is told about each [`JobEvent`] observed while a job is
//! followed. Callbacks cannot change the outcome of following; a callback that
//! fails is logged and otherwise ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::config::FollowConfig;
use crate::job::JobHandle;
use crate::job::JobStatus;

/// The timeout for a single webhook request.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that happened to a followed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// The job started running.
    Started,
    /// The job did not start in time.
    StartTimeout,
    /// The job produced no output in time.
    InactiveTimeout,
    /// The job did not finish in time.
    Timeout,
    /// The job was preempted.
    Preempted,
    /// The job was canceled.
    Canceled,
    /// The job failed.
    Failed {
        /// The exit code of the job.
        exit_code: i32,
    },
    /// The job succeeded.
    Succeeded,
}

impl JobEvent {
    /// Gets the event for a job that finished with the given status.
    ///
    /// Returns `None` if the status is not terminal.
    pub fn finished(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Pending | JobStatus::Running => None,
            JobStatus::Succeeded => Some(Self::Succeeded),
            JobStatus::Failed { exit_code } => Some(Self::Failed { exit_code }),
            JobStatus::Preempted => Some(Self::Preempted),
            JobStatus::Canceled => Some(Self::Canceled),
        }
    }
}

/// Observes the events of followed jobs.
#[async_trait]
pub trait Callback: fmt::Debug + Send + Sync {
    /// Called when an event happens to a job.
    async fn on_event(&self, job: &JobHandle, event: JobEvent) -> Result<()>;
}

/// The callbacks attached to a followed job.
#[derive(Debug, Clone, Default)]
pub struct Callbacks(Vec<Arc<dyn Callback>>);

impl Callbacks {
    /// Creates an empty set of callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback.
    pub fn push(&mut self, callback: Arc<dyn Callback>) {
        self.0.push(callback);
    }

    /// Determines if there are no callbacks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates the callbacks configured for followed jobs.
    ///
    /// A Slack webhook given on the command line replaces the configured one.
    pub fn configured(slack_webhook: Option<&str>, config: &FollowConfig) -> Result<Self> {
        let mut callbacks = Self::new();
        let webhook = match slack_webhook {
            Some(url) => {
                let parsed = Url::parse(url).context("the Slack webhook URL is invalid")?;
                if parsed.scheme() != "https" {
                    bail!("the Slack webhook URL must use HTTPS");
                }
                Some(secrecy::SecretString::from(url))
            }
            None => config
                .slack_webhook_url
                .as_ref()
                .map(|url| url.inner().clone()),
        };

        if let Some(webhook) = webhook {
            callbacks.push(Arc::new(SlackCallback::new(webhook)?));
        }

        Ok(callbacks)
    }

    /// Tells every callback about an event.
    pub async fn notify(&self, job: &JobHandle, event: JobEvent) {
        for callback in &self.0 {
            debug!(?event, ?callback, "notifying callback");
            if let Err(e) = callback.on_event(job, event).await {
                warn!("failed to notify about job `{name}`: {e:#}", name = job.name);
            }
        }
    }
}

/// The body of a Slack webhook message.
#[derive(Debug, Serialize)]
struct SlackMessage {
    /// The message text.
    text: String,
}

/// Posts job events to a Slack incoming webhook.
#[derive(Clone)]
pub struct SlackCallback {
    /// The HTTP client.
    client: reqwest::Client,
    /// The webhook URL; it embeds a credential.
    webhook: secrecy::SecretString,
}

impl fmt::Debug for SlackCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackCallback").finish_non_exhaustive()
    }
}

impl SlackCallback {
    /// Creates a callback posting to the given webhook.
    pub fn new(webhook: secrecy::SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client, webhook })
    }

    /// Renders the message posted for an event.
    pub fn message(job: &JobHandle, event: JobEvent) -> String {
        let link = match &job.url {
            Some(url) => format!("<{url}|*{name}*>", name = job.name),
            None => format!("*{name}*", name = job.name),
        };

        match event {
            JobEvent::Started => format!(":check: Job {link} has started! :runner:"),
            JobEvent::StartTimeout => format!(":warning: Job {link} failed to start in time!"),
            JobEvent::InactiveTimeout => format!(":zzz: Job {link} appears to be inactive!"),
            JobEvent::Timeout => format!(":warning: Job {link} failed to complete in time!"),
            JobEvent::Preempted => format!(":warning: Job {link} was preempted!"),
            JobEvent::Canceled => format!(":warning: Job {link} was canceled!"),
            JobEvent::Failed { exit_code } => {
                format!(":check-failed: Job {link} failed with exit code {exit_code}!")
            }
            JobEvent::Succeeded => format!(":check: Job {link} succeeded!"),
        }
    }
}

#[async_trait]
impl Callback for SlackCallback {
    async fn on_event(&self, job: &JobHandle, event: JobEvent) -> Result<()> {
        let body = SlackMessage {
            text: Self::message(job, event),
        };
        self.client
            .post(self.webhook.expose_secret())
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("failed to post to the Slack webhook")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    /// A callback that records the events it is told about.
    #[derive(Debug, Default)]
    pub(crate) struct Recorder {
        /// The recorded events.
        pub events: Mutex<Vec<JobEvent>>,
    }

    #[async_trait]
    impl Callback for Recorder {
        async fn on_event(&self, _: &JobHandle, event: JobEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// A callback that always fails.
    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl Callback for Broken {
        async fn on_event(&self, _: &JobHandle, _: JobEvent) -> Result<()> {
            anyhow::bail!("webhook is down")
        }
    }

    fn handle(url: Option<&str>) -> JobHandle {
        JobHandle {
            id: "job-1".to_string(),
            name: "happy-elephant".to_string(),
            url: url.map(str::to_string),
        }
    }

    #[test]
    fn slack_messages() {
        let linked = handle(Some("https://jobs.example.com/job-1"));
        assert_eq!(
            SlackCallback::message(&linked, JobEvent::Started),
            ":check: Job <https://jobs.example.com/job-1|*happy-elephant*> has started! :runner:"
        );
        assert_eq!(
            SlackCallback::message(&handle(None), JobEvent::Failed { exit_code: 3 }),
            ":check-failed: Job *happy-elephant* failed with exit code 3!"
        );
    }

    #[test]
    fn finished_statuses() {
        assert_eq!(JobEvent::finished(JobStatus::Running), None);
        assert_eq!(
            JobEvent::finished(JobStatus::Succeeded),
            Some(JobEvent::Succeeded)
        );
        assert_eq!(
            JobEvent::finished(JobStatus::Preempted),
            Some(JobEvent::Preempted)
        );
    }

    #[test]
    fn command_line_webhooks_replace_configured_ones() {
        let config = FollowConfig::default();
        assert!(Callbacks::configured(None, &config).unwrap().is_empty());
        assert!(
            !Callbacks::configured(Some("https://hooks.slack.com/services/T0/B0/X"), &config)
                .unwrap()
                .is_empty()
        );
        assert!(Callbacks::configured(Some("not a url"), &config).is_err());
        assert!(Callbacks::configured(Some("http://hooks.slack.com/x"), &config).is_err());

        let config = FollowConfig {
            slack_webhook_url: Some(crate::config::SecretString::from(
                "https://hooks.slack.com/services/T0/B0/Y",
            )),
            ..Default::default()
        };
        assert!(!Callbacks::configured(None, &config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_callbacks_do_not_stop_the_others() {
        let recorder = Arc::new(Recorder::default());
        let mut callbacks = Callbacks::new();
        callbacks.push(Arc::new(Broken));
        callbacks.push(recorder.clone());

        callbacks.notify(&handle(None), JobEvent::Succeeded).await;
        assert_eq!(*recorder.events.lock().unwrap(), [JobEvent::Succeeded]);
    }
}
