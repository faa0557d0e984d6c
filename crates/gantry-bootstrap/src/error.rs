//! Errors produced by the bootstrap procedure.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// A result type for bootstrap operations.
pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;

/// Represents an error that aborts the bootstrap procedure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A required environment variable was unset or empty.
    #[error("required environment variable `{0}` is not set")]
    MissingVariable(&'static str),

    /// An environment variable had a value that could not be interpreted.
    #[error("environment variable `{name}` has invalid value `{value}`: {reason}")]
    InvalidVariable {
        /// The name of the variable.
        name: &'static str,
        /// The offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A precondition for a stage was violated before anything was mutated.
    #[error("{0}")]
    Precondition(String),

    /// An external command exited unsuccessfully.
    #[error("`{label}` failed with {status} (see log `{path}`)", path = .log.display())]
    CommandFailed {
        /// The label of the command.
        label: String,
        /// The exit status of the command.
        status: ExitStatus,
        /// The path of the captured log for the command.
        log: PathBuf,
    },

    /// A retried operation failed on every attempt.
    #[error("`{label}` failed after {attempts} attempt(s)")]
    RetriesExhausted {
        /// The label of the retried operation.
        label: String,
        /// The number of attempts made.
        attempts: u32,
        /// The error from the last attempt.
        #[source]
        last: Box<BootstrapError>,
    },

    /// A required tool could not be installed by any known method.
    #[error("tool `{tool}` is unavailable and could not be installed")]
    ToolUnavailable {
        /// The name of the tool.
        tool: &'static str,
        /// The error from the last installation method tried.
        #[source]
        source: Option<Box<BootstrapError>>,
    },

    /// The source repository could not be cloned.
    #[error("failed to clone repository `{repo}`")]
    Clone {
        /// The repository that was being cloned.
        repo: String,
        /// The underlying failure.
        #[source]
        source: Box<BootstrapError>,
    },

    /// The requested reference does not exist in the cloned repository.
    #[error("reference `{reference}` was not found in repository `{repo}`")]
    RefNotFound {
        /// The repository that was cloned.
        repo: String,
        /// The reference that was requested.
        reference: String,
    },

    /// A file could not be downloaded.
    #[error("failed to download `{url}`")]
    Download {
        /// The URL being downloaded.
        url: String,
        /// The underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },

    /// An I/O operation failed.
    #[error("{context}")]
    Io {
        /// A description of what was being done.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The payload could not be executed.
    #[error("failed to execute `{program}`")]
    Exec {
        /// The program that was being executed.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    /// Creates an I/O error with the given context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Gets the captured log associated with this error, if there is one.
    ///
    /// Wrapped errors are searched so that a fatal error always points at the
    /// log of the command that actually failed.
    pub fn log(&self) -> Option<&Path> {
        match self {
            Self::CommandFailed { log, .. } => Some(log),
            Self::RetriesExhausted { last, .. } => last.log(),
            Self::Clone { source, .. } => source.log(),
            Self::ToolUnavailable {
                source: Some(source),
                ..
            } => source.log(),
            _ => None,
        }
    }

    /// Determines if retrying the failed operation might succeed.
    ///
    /// Command failures and download failures are assumed transient.
    /// Everything else is deterministic and is not worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::Download { .. })
    }
}
