//! The Gantry command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use anyhow::Context;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use gantry::commands;
use gantry::commands::CommandError;
use gantry::commands::CommandResult;
use gantry::config::Config;
use git_testament::git_testament;
use git_testament::render_testament;
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Commands {
    /// Runs a command from the current repository as a job on the cluster.
    ///
    /// The job's container clones the repository at the current commit,
    /// builds its Python environment, and then runs the command given after
    /// `--`.
    Run(commands::run::Args),

    /// Follows a job, streaming its log until it finishes.
    Follow(commands::follow::Args),

    /// Prints the log of a job.
    Logs(commands::logs::Args),

    /// Lists recent jobs in a workspace.
    List(commands::list::Args),

    /// Stops running jobs.
    Stop(commands::stop::Args),

    /// Finds clusters with free GPUs.
    FindGpus(commands::find_gpus::Args),

    /// Shows information about clusters.
    Cluster(commands::cluster::Args),

    /// Displays or initializes the configuration.
    Config(commands::config::Args),

    /// Generates shell completions.
    Completions(commands::completions::Args),

    /// Prepares a job's container and runs its command.
    #[command(hide = true)]
    Bootstrap(commands::bootstrap::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// A configuration file to read after the default ones.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

/// Runs the command line tool.
async fn inner() -> CommandResult {
    let cli = Cli::parse();

    tracing_log::LogTracer::init().context("failed to initialize logging")?;

    // Container logs are not a terminal but are still rendered with colors.
    let bootstrap = matches!(cli.command, Commands::Bootstrap(_));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.verbose.log_level_filter().as_trace().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_ansi(bootstrap || stderr().is_terminal())
        .with_target(!bootstrap)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to initialize logging")?;

    let load = || {
        Config::load(cli.config.as_deref())
            .context("failed to load the configuration")
            .map_err(CommandError::invalid)
    };

    match cli.command {
        Commands::Run(args) => commands::run::run(args, load()?).await,
        Commands::Follow(args) => commands::follow::follow(args, load()?).await,
        Commands::Logs(args) => commands::logs::logs(args, load()?).await,
        Commands::List(args) => commands::list::list(args, load()?).await,
        Commands::Stop(args) => commands::stop::stop(args, load()?).await,
        Commands::FindGpus(args) => commands::find_gpus::find(args, load()?).await,
        Commands::Cluster(args) => commands::cluster::cluster(args, load()?).await,
        Commands::Config(args) => commands::config::config(args, load()?).await,
        Commands::Completions(args) => {
            commands::completions::completions(args, &mut Cli::command());
            Ok(())
        }
        Commands::Bootstrap(args) => commands::bootstrap::bootstrap(args).await,
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(e.exit_code());
    }
}
