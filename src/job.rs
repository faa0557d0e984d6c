//! The job model shared by the launcher and the job service client.
//!
//! A [`JobRequest`] is built once from the command line, submitted once, and
//! never modified afterwards. Everything the container needs to bootstrap
//! itself travels in the request's environment variables.

use std::fmt;

use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// The path the `gantry` binary is mounted at inside the container.
pub const ENTRYPOINT_MOUNT_DIR: &str = "/gantry";

/// The default path of the results directory inside the container.
pub const DEFAULT_RESULTS_DIR: &str = "/results";

/// The image the job's container runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Image {
    /// An image stored by the job service.
    Beaker(String),
    /// An image pulled from a Docker registry.
    Docker(String),
}

/// The value of an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    /// A literal value.
    Value(String),
    /// The value of a workspace secret, resolved by the service.
    Secret(String),
}

/// An environment variable set in the job's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EnvVar {
    /// The name of the variable.
    pub name: String,
    /// The value of the variable.
    #[serde(flatten)]
    pub value: EnvValue,
}

impl EnvVar {
    /// Creates a variable with a literal value.
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Value(value.into()),
        }
    }

    /// Creates a variable whose value comes from a secret.
    pub fn secret(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Secret(secret.into()),
        }
    }
}

/// Something mounted into the job's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Mount {
    /// A dataset, or a path within one.
    Dataset {
        /// The name or identifier of the dataset.
        dataset: String,
        /// The path within the dataset to mount.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_path: Option<String>,
        /// Where the dataset is mounted.
        mount_path: String,
    },
    /// A secret written to a file.
    Secret {
        /// The name of the secret.
        secret: String,
        /// Where the secret is mounted.
        mount_path: String,
    },
    /// A path on the host.
    HostPath {
        /// The path on the host.
        source: String,
        /// Where the path is mounted.
        mount_path: String,
    },
    /// A Weka storage bucket.
    Weka {
        /// The name of the bucket.
        bucket: String,
        /// Where the bucket is mounted.
        mount_path: String,
    },
}

impl Mount {
    /// Gets the path the mount appears at in the container.
    pub fn mount_path(&self) -> &str {
        match self {
            Self::Dataset { mount_path, .. }
            | Self::Secret { mount_path, .. }
            | Self::HostPath { mount_path, .. }
            | Self::Weka { mount_path, .. } => mount_path,
        }
    }
}

/// The resources requested for the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Resources {
    /// The number of CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// The number of GPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    /// The amount of memory, such as `32GiB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// The amount of shared memory, such as `10GiB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_memory: Option<String>,
}

/// Constraints on where the job may be placed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Constraints {
    /// Cluster names or patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    /// Acceptable GPU types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_types: Vec<String>,
    /// Tags a cluster must carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Specific hosts to run on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
}

/// Settings for jobs with more than one replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Replication {
    /// The number of replicas.
    pub replicas: u32,
    /// Whether a leader replica is selected and advertised to the others.
    pub leader_selection: bool,
    /// Whether replicas use the host's network.
    pub host_networking: bool,
    /// Whether the failure of one replica fails the job.
    pub propagate_failure: bool,
    /// Whether the preemption of one replica preempts the job.
    pub propagate_preemption: bool,
    /// How long replicas wait for each other to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronized_start_timeout: Option<String>,
}

/// A request to run one job.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobRequest {
    /// The workspace the job belongs to.
    #[builder(into)]
    pub workspace: String,
    /// The name of the task within the job.
    #[builder(into)]
    pub task_name: String,
    /// A description of the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The budget account charged for the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    /// Groups the job is added to.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// The container image.
    pub image: Image,
    /// The container's start command.
    pub command: Vec<String>,
    /// The arguments passed to the start command.
    pub arguments: Vec<String>,
    /// The resources requested.
    #[builder(default)]
    pub resources: Resources,
    /// Placement constraints.
    #[builder(default)]
    pub constraints: Constraints,
    /// Environment variables.
    #[builder(default)]
    pub env: Vec<EnvVar>,
    /// Mounts.
    #[builder(default)]
    pub mounts: Vec<Mount>,
    /// Where the container writes its results.
    #[builder(into)]
    pub result_path: String,
    /// The scheduling priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Whether the job may be preempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preemptible: Option<bool>,
    /// How many times a failed job is retried by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// The maximum run time of the task, such as `2h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Replication settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<Replication>,
}

impl JobRequest {
    /// Gets the value of a literal environment variable.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|e| match &e.value {
            EnvValue::Value(v) if e.name == name => Some(v.as_str()),
            _ => None,
        })
    }
}

/// A reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobHandle {
    /// The service's identifier for the job.
    pub id: String,
    /// The name the job was created with.
    pub name: String,
    /// A link to the job in the service's web interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "{name} ({url})", name = self.name),
            None => write!(f, "{name} ({id})", name = self.name, id = self.id),
        }
    }
}

/// The state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// The job is waiting to be scheduled or to start.
    Pending,
    /// The job is running.
    Running,
    /// The job exited successfully.
    Succeeded,
    /// The job exited with a non-zero exit code.
    Failed {
        /// The exit code of the job's container.
        exit_code: i32,
    },
    /// The job was preempted by the scheduler.
    Preempted,
    /// The job was canceled.
    Canceled,
}

impl JobStatus {
    /// Determines if the job has started (or already finished).
    pub fn has_started(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Determines if the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Gets the exit code the launcher exits with for a finished job.
    ///
    /// A failed job's exit code is mirrored; a job that did not run to
    /// completion maps to `1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { exit_code } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.pad("pending"),
            Self::Running => f.pad("running"),
            Self::Succeeded => f.pad("succeeded"),
            Self::Failed { exit_code } => f.pad(&format!("failed (exit code {exit_code})")),
            Self::Preempted => f.pad("preempted"),
            Self::Canceled => f.pad("canceled"),
        }
    }
}

/// Detailed information about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobInfo {
    /// The job.
    #[serde(flatten)]
    pub handle: JobHandle,
    /// The job's current state.
    pub status: JobStatus,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// The identifier of the dataset holding the job's results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_dataset: Option<String>,
}

/// A line of output from a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LogLine {
    /// The offset of the line in the job's log.
    pub offset: u64,
    /// When the line was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// The text of the line, without a trailing newline.
    pub message: String,
}

/// A page of a job's log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LogChunk {
    /// The lines in the page.
    pub lines: Vec<LogLine>,
    /// The offset to request the next page from.
    pub next_offset: u64,
}

/// A job in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobSummary {
    /// The job.
    #[serde(flatten)]
    pub handle: JobHandle,
    /// The user that submitted the job.
    pub author: String,
    /// The job's current state.
    pub status: JobStatus,
    /// When the job was created.
    pub created: DateTime<Utc>,
}
