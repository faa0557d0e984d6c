//! Implementation of the `bootstrap` command.
//!
//! This is the entrypoint of a job's container; it is not meant to be run by
//! hand.

use anyhow::Context;
use clap::Parser;
use gantry_bootstrap::Bootstrap;
use gantry_bootstrap::environment::ProcessEnvironment;

use crate::commands::CommandResult;

/// Arguments for the `bootstrap` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The command to run once the container is prepared.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub args: Vec<String>,
}

/// The main function for the `bootstrap` command.
///
/// On success the process is replaced by the job's command, so this only
/// returns on failure.
pub async fn bootstrap(args: Args) -> CommandResult {
    let bootstrap = Bootstrap::new(ProcessEnvironment::from_current());
    match bootstrap.run(&args.args).await.context("bootstrap failed")? {}
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_follows_separator() {
        let args =
            Args::try_parse_from(["bootstrap", "--", "python", "-m", "train", "--lr", "0.1"])
                .unwrap();
        assert_eq!(args.args, ["python", "-m", "train", "--lr", "0.1"]);
    }

    #[test]
    fn command_is_required() {
        assert!(Args::try_parse_from(["bootstrap", "--"]).is_err());
        assert!(Args::try_parse_from(["bootstrap", "python"]).is_err());
    }
}
