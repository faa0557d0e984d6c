//! Implementation of gantry CLI commands.

use std::fmt;

use crate::job::JobStatus;

pub mod bootstrap;
pub mod cluster;
pub mod completions;
pub mod config;
pub mod find_gpus;
pub mod follow;
pub mod list;
pub mod logs;
pub mod run;
pub mod stop;

/// The exit code for invalid command line options.
pub const INVALID_EXIT_CODE: i32 = 2;

/// Represents an error from a command.
#[derive(Debug)]
pub enum CommandError {
    /// The command failed.
    Single(anyhow::Error),
    /// The command's options are invalid.
    Invalid(anyhow::Error),
    /// The job the command followed did not succeed.
    Job {
        /// The name of the job.
        name: String,
        /// The job's final state.
        status: JobStatus,
    },
}

impl CommandError {
    /// Gets the exit code the process exits with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Single(_) => 1,
            Self::Invalid(_) => INVALID_EXIT_CODE,
            Self::Job { status, .. } => status.exit_code(),
        }
    }

    /// Creates an error for invalid options.
    pub fn invalid(e: impl Into<anyhow::Error>) -> Self {
        Self::Invalid(e.into())
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(e) | Self::Invalid(e) => write!(f, "{e:?}"),
            Self::Job { name, status } => write!(f, "job `{name}` {status}"),
        }
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(e: anyhow::Error) -> Self {
        Self::Single(e)
    }
}

/// The result type of a command.
pub type CommandResult<T = ()> = Result<T, CommandError>;
