//! Implementation of the `config` command.

use std::io::BufRead;
use std::io::IsTerminal;
use std::io::stdin;

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;
use secrecy::ExposeSecret;
use tracing::info;

use crate::client::HttpJobService;
use crate::client::JobService;
use crate::commands::CommandError;
use crate::commands::CommandResult;
use crate::config::Config;

/// Arguments for the `config` command.
#[derive(Parser, Debug)]
pub struct Args {
    /// The configuration subcommand.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands of the `config` command.
#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Prints a default configuration file.
    Init,

    /// Prints the configuration in effect, with secrets redacted.
    Resolve,

    /// Stores a GitHub token as a workspace secret.
    ///
    /// The token is read from `GITHUB_TOKEN` or, failing that, from the
    /// first line of standard input.
    SetGhToken {
        /// The workspace to store the secret in.
        #[arg(short, long)]
        workspace: Option<String>,

        /// The name of the secret; defaults to `gh_token_secret`.
        #[arg(long)]
        secret: Option<String>,

        /// The token to store.
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, hide = true)]
        token: Option<String>,
    },
}

/// Reads a token from standard input.
fn read_token() -> anyhow::Result<String> {
    if stdin().is_terminal() {
        eprint!("GitHub token: ");
    }

    let mut line = String::new();
    stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read the token from standard input")?;
    Ok(line.trim().to_string())
}

/// Stores a GitHub token in a workspace.
pub async fn set_gh_token<S>(
    service: &S,
    workspace: &str,
    secret: &str,
    token: secrecy::SecretString,
) -> CommandResult
where
    S: JobService + ?Sized,
{
    if token.expose_secret().is_empty() {
        return Err(CommandError::invalid(anyhow!("the GitHub token cannot be empty")));
    }

    service
        .write_secret(workspace, secret, &token)
        .await
        .with_context(|| format!("failed to write secret `{secret}` in workspace `{workspace}`"))?;
    info!("stored the GitHub token as secret `{secret}` in workspace `{workspace}`");
    Ok(())
}

/// The main function for the `config` command.
pub async fn config(args: Args, mut config: Config) -> CommandResult {
    match args.command {
        ConfigSubcommand::Init => {
            println!(
                "{}",
                toml::to_string_pretty(&Config::default())
                    .context("failed to serialize the default configuration")?
            );
        }
        ConfigSubcommand::Resolve => {
            config.redact();
            println!(
                "{}",
                toml::to_string_pretty(&config).context("failed to serialize the configuration")?
            );
        }
        ConfigSubcommand::SetGhToken {
            workspace,
            secret,
            token,
        } => {
            let workspace = workspace
                .or_else(|| config.workspace.clone())
                .ok_or_else(|| {
                    CommandError::invalid(anyhow!(
                        "a workspace is required; use `--workspace` or set `workspace` in the \
                         configuration"
                    ))
                })?;
            let secret = secret.unwrap_or_else(|| config.gh_token_secret.clone());
            let token = match token {
                Some(token) => token,
                None => read_token()?,
            };

            let service = HttpJobService::new(&config.service)?;
            set_gh_token(&service, &workspace, &secret, token.into()).await?;
        }
    }

    Ok(())
}
