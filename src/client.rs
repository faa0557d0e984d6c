//! The client for the remote job service.
//!
//! The launcher depends only on the [`JobService`] trait; [`HttpJobService`]
//! implements it over the service's REST API.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialBackoff;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::cluster::Cluster;
use crate::cluster::ClusterUtilization;
use crate::cluster::Node;
use crate::config::ServiceConfig;
use crate::job::JobHandle;
use crate::job::JobInfo;
use crate::job::JobRequest;
use crate::job::JobSummary;
use crate::job::LogChunk;
use crate::job::LogLine;

/// The user agent sent with every request.
const USER_AGENT: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));

/// The timeout for a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The number of times a log page is fetched before giving up.
const LOG_FETCH_ATTEMPTS: usize = 6;

/// The longest pause, in milliseconds, between log page fetches.
const LOG_FETCH_MAX_DELAY_MS: u64 = 30_000;

/// Represents an error from the job service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be sent or its response could not be read.
    #[error("failed to send request to `{url}`")]
    Http {
        /// The URL of the request.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The service responded with an error.
    #[error("job service returned {status} for `{url}`: {message}")]
    Api {
        /// The URL of the request.
        url: String,
        /// The response status.
        status: StatusCode,
        /// The error message from the service.
        message: String,
    },
    /// The requested resource does not exist.
    #[error("{kind} `{name}` was not found")]
    NotFound {
        /// The kind of resource.
        kind: &'static str,
        /// The name of the resource.
        name: String,
    },
    /// A job with the requested name already exists.
    #[error("a job named `{0}` already exists")]
    Conflict(String),
    /// The service URL cannot be used as a base for requests.
    #[error("invalid job service URL `{0}`")]
    InvalidUrl(String),
}

impl ClientError {
    /// Determines if retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::NotFound { .. } | Self::Conflict(_) | Self::InvalidUrl(_) => false,
        }
    }
}

/// The filters for a job listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// The workspace to list jobs from.
    pub workspace: String,
    /// Only list jobs submitted by this user.
    pub author: Option<String>,
    /// The maximum number of jobs to list.
    pub limit: Option<u32>,
    /// Only list jobs that have not finished.
    pub running: bool,
}

/// The operations the launcher needs from the job service.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submits a job under the given name.
    ///
    /// Returns [`ClientError::Conflict`] if the name is taken.
    async fn submit(&self, name: &str, request: &JobRequest) -> Result<JobHandle, ClientError>;

    /// Gets a job.
    async fn job(&self, id: &str) -> Result<JobInfo, ClientError>;

    /// Gets the page of a job's log starting at `offset`.
    async fn logs(&self, id: &str, offset: u64) -> Result<LogChunk, ClientError>;

    /// Cancels a job.
    async fn cancel(&self, id: &str) -> Result<(), ClientError>;

    /// Lists jobs.
    async fn list(&self, query: &ListQuery) -> Result<Vec<JobSummary>, ClientError>;

    /// Determines if a workspace secret exists.
    async fn secret_exists(&self, workspace: &str, name: &str) -> Result<bool, ClientError>;

    /// Creates or replaces a workspace secret.
    async fn write_secret(
        &self,
        workspace: &str,
        name: &str,
        value: &secrecy::SecretString,
    ) -> Result<(), ClientError>;

    /// Lists the clusters visible to the user.
    async fn clusters(&self) -> Result<Vec<Cluster>, ClientError>;

    /// Lists the nodes of a cluster.
    async fn cluster_nodes(&self, cluster: &str) -> Result<Vec<Node>, ClientError>;

    /// Gets the current use of a cluster.
    async fn cluster_utilization(&self, cluster: &str) -> Result<ClusterUtilization, ClientError>;
}

/// The body of an error response.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    /// The error message.
    message: String,
}

/// The body of a job submission.
#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    /// The name of the job.
    name: &'a str,
    /// The job.
    spec: &'a JobRequest,
}

/// The body of a secret write.
#[derive(Serialize)]
struct SecretValue<'a> {
    /// The value of the secret.
    value: &'a str,
}

/// A job service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpJobService {
    /// The HTTP client.
    client: reqwest::Client,
    /// The base URL of the service.
    base: Url,
    /// The token sent as a bearer token.
    token: Option<secrecy::SecretString>,
}

impl HttpJobService {
    /// Creates a client from the service configuration.
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        let base = config.url()?.clone();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            client,
            base,
            token: config.token.as_ref().map(|t| t.inner().clone()),
        })
    }

    /// Builds the URL of an API endpoint.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    /// Starts a request.
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(%method, %url, "sending request");
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Sends a request, turning error statuses into errors.
    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response, ClientError> {
        let response = request.send().await.map_err(|source| ClientError::Http {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(ClientError::Api {
            url: url.to_string(),
            status,
            message,
        })
    }

    /// Reads a JSON response body.
    async fn json<T: DeserializeOwned>(response: Response, url: &Url) -> Result<T, ClientError> {
        response.json().await.map_err(|source| ClientError::Http {
            url: url.to_string(),
            source,
        })
    }
}

/// Maps a `404` response to [`ClientError::NotFound`].
fn not_found(kind: &'static str, name: &str) -> impl FnOnce(ClientError) -> ClientError {
    move |e| match e {
        ClientError::Api { status, .. } if status == StatusCode::NOT_FOUND => {
            ClientError::NotFound {
                kind,
                name: name.to_string(),
            }
        }
        e => e,
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn submit(&self, name: &str, request: &JobRequest) -> Result<JobHandle, ClientError> {
        let url = self.endpoint(&["workspaces", &request.workspace, "jobs"])?;
        let body = SubmitRequest {
            name,
            spec: request,
        };
        let response = self
            .send(self.request(Method::POST, url.clone()).json(&body), &url)
            .await
            .map_err(|e| match e {
                ClientError::Api { status, .. } if status == StatusCode::CONFLICT => {
                    ClientError::Conflict(name.to_string())
                }
                e => not_found("workspace", &request.workspace)(e),
            })?;
        Self::json(response, &url).await
    }

    async fn job(&self, id: &str) -> Result<JobInfo, ClientError> {
        let url = self.endpoint(&["jobs", id])?;
        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await
            .map_err(not_found("job", id))?;
        Self::json(response, &url).await
    }

    async fn logs(&self, id: &str, offset: u64) -> Result<LogChunk, ClientError> {
        let mut url = self.endpoint(&["jobs", id, "logs"])?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());
        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await
            .map_err(not_found("job", id))?;
        Self::json(response, &url).await
    }

    async fn cancel(&self, id: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&["jobs", id, "cancel"])?;
        self.send(self.request(Method::POST, url.clone()), &url)
            .await
            .map_err(not_found("job", id))?;
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<JobSummary>, ClientError> {
        let mut url = self.endpoint(&["workspaces", &query.workspace, "jobs"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(author) = &query.author {
                pairs.append_pair("author", author);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if query.running {
                pairs.append_pair("finalized", "false");
            }
        }

        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await
            .map_err(not_found("workspace", &query.workspace))?;
        Self::json(response, &url).await
    }

    async fn secret_exists(&self, workspace: &str, name: &str) -> Result<bool, ClientError> {
        let url = self.endpoint(&["workspaces", workspace, "secrets", name])?;
        match self.send(self.request(Method::GET, url.clone()), &url).await {
            Ok(_) => Ok(true),
            Err(ClientError::Api { status, .. }) if status == StatusCode::NOT_FOUND => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn write_secret(
        &self,
        workspace: &str,
        name: &str,
        value: &secrecy::SecretString,
    ) -> Result<(), ClientError> {
        let url = self.endpoint(&["workspaces", workspace, "secrets", name])?;
        let body = SecretValue {
            value: value.expose_secret(),
        };
        self.send(self.request(Method::PUT, url.clone()).json(&body), &url)
            .await
            .map_err(not_found("workspace", workspace))?;
        Ok(())
    }

    async fn clusters(&self) -> Result<Vec<Cluster>, ClientError> {
        let url = self.endpoint(&["clusters"])?;
        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await?;
        Self::json(response, &url).await
    }

    async fn cluster_nodes(&self, cluster: &str) -> Result<Vec<Node>, ClientError> {
        let url = self.endpoint(&["clusters", cluster, "nodes"])?;
        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await
            .map_err(not_found("cluster", cluster))?;
        Self::json(response, &url).await
    }

    async fn cluster_utilization(&self, cluster: &str) -> Result<ClusterUtilization, ClientError> {
        let url = self.endpoint(&["clusters", cluster, "utilization"])?;
        let response = self
            .send(self.request(Method::GET, url.clone()), &url)
            .await
            .map_err(not_found("cluster", cluster))?;
        Self::json(response, &url).await
    }
}

/// The state of a log stream between items.
struct LogStreamState<'a, S: ?Sized> {
    /// The service the log is read from.
    service: &'a S,
    /// The job whose log is read.
    id: &'a str,
    /// The offset of the next page.
    offset: u64,
    /// Lines fetched but not yet yielded.
    buffered: VecDeque<LogLine>,
    /// The interval between fetches when no new lines are available.
    poll_interval: Duration,
    /// Whether the job was seen to be finished.
    finished: bool,
}

/// Streams a job's log from `offset` until the job finishes.
///
/// Pages are fetched by offset, so a stream that fails can be restarted from
/// the offset of the last line it yielded. Transient failures are retried
/// with capped exponential backoff before being yielded as errors.
pub fn stream_logs<'a, S>(
    service: &'a S,
    id: &'a str,
    offset: u64,
    poll_interval: Duration,
) -> impl Stream<Item = Result<LogLine, ClientError>> + 'a
where
    S: JobService + ?Sized,
{
    let state = LogStreamState {
        service,
        id,
        offset,
        buffered: VecDeque::new(),
        poll_interval,
        finished: false,
    };

    futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(line) = state.buffered.pop_front() {
                return Some((Ok(line), Some(state)));
            }

            // A job is only known to be finished after its status is read.
            // Every page after that is drained until one comes back empty.
            if !state.finished {
                match with_retries(|| state.service.job(state.id)).await {
                    Ok(info) => state.finished = info.status.is_terminal(),
                    Err(e) => return Some((Err(e), None)),
                }
            }

            let chunk = match with_retries(|| state.service.logs(state.id, state.offset))
                .await
            {
                Ok(chunk) => chunk,
                Err(e) => return Some((Err(e), None)),
            };

            if chunk.lines.is_empty() {
                if state.finished {
                    return None;
                }

                tokio::time::sleep(state.poll_interval).await;
                continue;
            }

            state.offset = chunk.next_offset.max(state.offset);
            state.buffered.extend(chunk.lines);
        }
    })
}

/// Runs a request, retrying transient failures.
pub(crate) async fn with_retries<T, F, Fut>(mut fetch: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    Retry::spawn_notify(
        ExponentialBackoff::from_millis(50)
            .max_delay_millis(LOG_FETCH_MAX_DELAY_MS)
            .take(LOG_FETCH_ATTEMPTS - 1),
        || {
            let fut = fetch();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        RetryError::transient(e)
                    } else {
                        RetryError::permanent(e)
                    }
                })
            }
        },
        |e: &ClientError, _| {
            warn!(e = %e, "failed to read from the job service; retrying");
        },
    )
    .await
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::StreamExt;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::JobStatus;

    /// An in-memory job service.
    #[derive(Debug, Default)]
    pub(crate) struct FakeService {
        /// Names already taken.
        pub taken: Mutex<Vec<String>>,
        /// The number of submissions rejected as conflicts regardless of name.
        pub conflicts: Mutex<u32>,
        /// Submitted jobs, by name.
        pub submitted: Mutex<Vec<(String, JobRequest)>>,
        /// Statuses returned by successive `job` calls; the last repeats.
        pub statuses: Mutex<VecDeque<JobStatus>>,
        /// The job's full log.
        pub log: Mutex<Vec<String>>,
        /// The number of lines revealed per `logs` call.
        pub page_size: usize,
        /// Errors returned by successive `logs` calls before any page.
        pub log_errors: Mutex<VecDeque<ClientError>>,
        /// The number of `cancel` calls.
        pub cancels: Mutex<u32>,
        /// Existing secrets.
        pub secrets: Mutex<Vec<String>>,
        /// The clusters, in the order the service lists them.
        pub clusters: Vec<Cluster>,
        /// The nodes of each cluster.
        pub nodes: HashMap<String, Vec<Node>>,
        /// The utilization reported for every cluster.
        pub utilization: Option<ClusterUtilization>,
    }

    impl FakeService {
        pub(crate) fn with_statuses(statuses: &[JobStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                page_size: 2,
                ..Default::default()
            }
        }

        fn status(&self) -> JobStatus {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                statuses.front().copied().unwrap_or(JobStatus::Pending)
            }
        }
    }

    #[async_trait]
    impl JobService for FakeService {
        async fn submit(&self, name: &str, request: &JobRequest) -> Result<JobHandle, ClientError> {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(ClientError::Conflict(name.to_string()));
            }

            let mut taken = self.taken.lock().unwrap();
            if taken.iter().any(|t| t == name) {
                return Err(ClientError::Conflict(name.to_string()));
            }
            taken.push(name.to_string());
            self.submitted
                .lock()
                .unwrap()
                .push((name.to_string(), request.clone()));
            Ok(JobHandle {
                id: format!("job-{n}", n = taken.len()),
                name: name.to_string(),
                url: None,
            })
        }

        async fn job(&self, id: &str) -> Result<JobInfo, ClientError> {
            Ok(JobInfo {
                handle: JobHandle {
                    id: id.to_string(),
                    name: "job".to_string(),
                    url: None,
                },
                status: self.status(),
                started: None,
                finished: None,
                result_dataset: Some("results-dataset".to_string()),
            })
        }

        async fn logs(&self, _: &str, offset: u64) -> Result<LogChunk, ClientError> {
            if let Some(e) = self.log_errors.lock().unwrap().pop_front() {
                return Err(e);
            }

            let log = self.log.lock().unwrap();
            let start = usize::try_from(offset).unwrap().min(log.len());
            let end = (start + self.page_size).min(log.len());
            Ok(LogChunk {
                lines: (start..end)
                    .map(|i| LogLine {
                        offset: i as u64,
                        timestamp: None,
                        message: log[i].clone(),
                    })
                    .collect(),
                next_offset: end as u64,
            })
        }

        async fn cancel(&self, _: &str) -> Result<(), ClientError> {
            *self.cancels.lock().unwrap() += 1;
            self.statuses.lock().unwrap().clear();
            self.statuses
                .lock()
                .unwrap()
                .push_back(JobStatus::Canceled);
            Ok(())
        }

        async fn list(&self, _: &ListQuery) -> Result<Vec<JobSummary>, ClientError> {
            Ok(Vec::new())
        }

        async fn secret_exists(&self, _: &str, name: &str) -> Result<bool, ClientError> {
            Ok(self.secrets.lock().unwrap().iter().any(|s| s == name))
        }

        async fn write_secret(
            &self,
            _: &str,
            name: &str,
            _: &secrecy::SecretString,
        ) -> Result<(), ClientError> {
            self.secrets.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn clusters(&self) -> Result<Vec<Cluster>, ClientError> {
            Ok(self.clusters.clone())
        }

        async fn cluster_nodes(&self, cluster: &str) -> Result<Vec<Node>, ClientError> {
            self.nodes
                .get(cluster)
                .cloned()
                .ok_or_else(|| ClientError::NotFound {
                    kind: "cluster",
                    name: cluster.to_string(),
                })
        }

        async fn cluster_utilization(
            &self,
            cluster: &str,
        ) -> Result<ClusterUtilization, ClientError> {
            self.utilization
                .clone()
                .filter(|u| u.cluster.name == cluster)
                .ok_or_else(|| ClientError::NotFound {
                    kind: "cluster",
                    name: cluster.to_string(),
                })
        }
    }

    fn unavailable() -> ClientError {
        ClientError::Api {
            url: "http://jobs.example.com".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streams_until_the_job_finishes() {
        let service = FakeService::with_statuses(&[
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Succeeded,
        ]);
        *service.log.lock().unwrap() = ["one", "two", "three"].map(String::from).to_vec();

        let lines: Vec<_> = stream_logs(&service, "job-1", 0, Duration::from_secs(1))
            .map_ok(|l| l.message)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, ["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_restart_from_an_offset() {
        let service = FakeService::with_statuses(&[JobStatus::Succeeded]);
        *service.log.lock().unwrap() = ["one", "two", "three"].map(String::from).to_vec();

        let lines: Vec<_> = stream_logs(&service, "job-1", 2, Duration::from_secs(1))
            .map_ok(|l| l.message)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, ["three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_yield_every_page() {
        let service = FakeService::with_statuses(&[JobStatus::Succeeded]);
        *service.log.lock().unwrap() = ["a", "b", "c", "d", "e"].map(String::from).to_vec();

        let lines: Vec<_> = stream_logs(&service, "job-1", 0, Duration::from_secs(1))
            .map_ok(|l| l.message)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let service = FakeService::with_statuses(&[JobStatus::Succeeded]);
        *service.log.lock().unwrap() = vec!["one".to_string()];
        service
            .log_errors
            .lock()
            .unwrap()
            .extend([unavailable(), unavailable()]);

        let lines: Vec<_> = stream_logs(&service, "job-1", 0, Duration::from_secs(1))
            .map_ok(|l| l.message)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(lines, ["one"]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_end_the_stream() {
        let service = FakeService::with_statuses(&[JobStatus::Running]);
        service.log_errors.lock().unwrap().push_back(ClientError::NotFound {
            kind: "job",
            name: "job-1".to_string(),
        });

        let items: Vec<_> = stream_logs(&service, "job-1", 0, Duration::from_secs(1))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ClientError::NotFound { .. })));
    }

    #[test]
    fn endpoints() {
        let service = HttpJobService::new(&ServiceConfig {
            url: Some("https://jobs.example.com/beaker/".parse().unwrap()),
            token: None,
            insecure: false,
        })
        .unwrap();
        assert_eq!(
            service
                .endpoint(&["workspaces", "ai2/example", "jobs"])
                .unwrap()
                .as_str(),
            "https://jobs.example.com/beaker/api/v1/workspaces/ai2%2Fexample/jobs"
        );
    }
}
