//! The in-container bootstrap procedure for Gantry jobs.
//!
//! A job's container starts by running the bootstrap, which prepares a
//! reproducible environment and then replaces itself with the user's command:
//!
//! 1. the job's environment variables are read and validated into a
//!    [`BootstrapContext`](context::BootstrapContext);
//! 2. the source repository is cloned at the requested revision;
//! 3. a Python environment is constructed with `uv` or `conda` and the
//!    project's dependencies are installed;
//! 4. collective-communication networking is configured for multi-node jobs;
//! 5. the payload is executed.
//!
//! The output of every external command is captured to a numbered log file in
//! the job's results directory, and transient failures are retried with
//! capped exponential backoff.

pub mod accelerator;
pub mod context;
pub mod environment;
mod error;
pub mod logs;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod tools;

pub use error::BootstrapError;
pub use error::Result;
pub use pipeline::Bootstrap;
