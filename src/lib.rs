//! Launches commands from a Git repository as jobs on a container cluster.
//!
//! The launcher captures the state of the local repository, describes a job
//! whose container clones that exact commit, submits it to the job service,
//! and optionally follows it to completion. Inside the container, the
//! [`gantry_bootstrap`] crate prepares the environment before running the
//! user's command.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod callbacks;
pub mod client;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod git;
pub mod job;
pub mod launch;
pub mod names;
