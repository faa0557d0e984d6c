//! Implementation of the `run` command.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use clap::Parser;
use clap::ValueEnum;
use gantry_bootstrap::payload::ExecMethod;
use rand::Rng;
use tracing::info;
use tracing::warn;

use crate::callbacks::Callbacks;
use crate::client::HttpJobService;
use crate::client::JobService;
use crate::commands::CommandError;
use crate::commands::CommandResult;
use crate::commands::follow::report;
use crate::config::Config;
use crate::config::PythonManager;
use crate::git::GitRepoState;
use crate::job::Constraints;
use crate::job::ENTRYPOINT_MOUNT_DIR;
use crate::job::EnvValue;
use crate::job::EnvVar;
use crate::job::Image;
use crate::job::JobRequest;
use crate::job::Mount;
use crate::job::Replication;
use crate::job::Resources;
use crate::launch::FollowOptions;
use crate::launch::attach;
use crate::launch::shutdown_signal;
use crate::launch::submit_unique;
use crate::names::generate_job_name;

/// The files that mark a directory as an installable Python project.
const PROJECT_FILES: &[&str] = &["pyproject.toml", "setup.py", "setup.cfg"];

/// The `conda` environment files looked for in the source tree.
const CONDA_FILES: &[&str] = &["environment.yml", "environment.yaml"];

/// The synchronized start timeout of replicated `torchrun` jobs.
const DEFAULT_SYNCHRONIZED_START_TIMEOUT: &str = "5m";

/// A high-speed interconnect a job requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Interconnect {
    /// InfiniBand.
    Ib,
    /// GPUDirect-TCPXO.
    Tcpxo,
}

impl Interconnect {
    /// Gets the cluster tag that advertises the interconnect.
    fn tag(&self) -> &'static str {
        match self {
            Self::Ib => "interconnect:ib",
            Self::Tcpxo => "interconnect:tcpxo",
        }
    }
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
#[command(
    after_help = "Example:\n  $ gantry run --workspace ai2/example --gpus 1 --show-logs -- python train.py"
)]
pub struct Args {
    /// The name of the job. Defaults to a randomly generated name.
    #[arg(short, long)]
    pub name: Option<String>,

    /// A description of the job.
    #[arg(short, long)]
    pub description: Option<String>,

    /// The workspace to run the job in.
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// The budget account to charge the job to.
    #[arg(long)]
    pub budget: Option<String>,

    /// A group to add the job to. May be repeated.
    #[arg(long = "group", value_name = "GROUP")]
    pub groups: Vec<String>,

    /// The name of the job's task.
    #[arg(long, default_value = "main")]
    pub task_name: String,

    /// An image stored by the job service to run.
    #[arg(long, conflicts_with = "docker_image")]
    pub beaker_image: Option<String>,

    /// A Docker image to run.
    #[arg(long)]
    pub docker_image: Option<String>,

    /// The number of CPUs to request.
    #[arg(long)]
    pub cpus: Option<f64>,

    /// The number of GPUs to request.
    #[arg(long)]
    pub gpus: Option<u32>,

    /// The amount of memory to request, such as `32GiB`.
    #[arg(long)]
    pub memory: Option<String>,

    /// The amount of shared memory to request, such as `10GiB`.
    #[arg(long)]
    pub shared_memory: Option<String>,

    /// A cluster (or pattern of clusters) to run on. May be repeated.
    #[arg(short, long = "cluster", value_name = "CLUSTER")]
    pub clusters: Vec<String>,

    /// A GPU type to run on. May be repeated.
    #[arg(long = "gpu-type", value_name = "TYPE")]
    pub gpu_types: Vec<String>,

    /// A tag that the cluster must have. May be repeated.
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// A host to run on. May be repeated.
    #[arg(long = "hostname", value_name = "HOST")]
    pub hostnames: Vec<String>,

    /// A high-speed interconnect the cluster must have.
    #[arg(long, value_enum)]
    pub interconnect: Option<Interconnect>,

    /// A dataset to mount, as `NAME:/mount` or `NAME:sub/path:/mount`.
    #[arg(long = "dataset", value_name = "SPEC")]
    pub datasets: Vec<String>,

    /// An environment variable, as `NAME=VALUE` or `NAME` to copy it from the
    /// local environment.
    #[arg(long = "env", value_name = "NAME[=VALUE]")]
    pub env: Vec<String>,

    /// An environment variable set from a secret, as `NAME=SECRET` or `NAME`
    /// for a secret of the same name.
    #[arg(long = "env-secret", value_name = "NAME[=SECRET]")]
    pub env_secrets: Vec<String>,

    /// A secret to mount as a file, as `SECRET:/mount/path`.
    #[arg(long = "dataset-secret", value_name = "SECRET:PATH")]
    pub dataset_secrets: Vec<String>,

    /// A host directory to mount, as `/host/path:/mount/path`.
    #[arg(short, long = "mount", value_name = "SOURCE:TARGET")]
    pub mounts: Vec<String>,

    /// A Weka bucket to mount, as `BUCKET:/mount/path`.
    #[arg(long = "weka", value_name = "BUCKET:PATH")]
    pub weka: Vec<String>,

    /// The number of replicas of the task to run.
    #[arg(long, allow_negative_numbers = true)]
    pub replicas: Option<i64>,

    /// Select a leader replica whose hostname is shared with the others.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub leader_selection: Option<bool>,

    /// Use the host's network in replicas.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub host_networking: Option<bool>,

    /// Fail the whole job when any replica fails.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub propagate_failure: Option<bool>,

    /// Preempt the whole job when any replica is preempted.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub propagate_preemption: Option<bool>,

    /// How long replicas wait for each other to start, such as `5m`.
    #[arg(long)]
    pub synchronized_start_timeout: Option<String>,

    /// Launch the command with `torchrun`.
    #[arg(long)]
    pub torchrun: bool,

    /// The Python package manager to use in the container.
    #[arg(long, value_enum)]
    pub python_manager: Option<PythonManager>,

    /// Use the Python interpreter already in the image.
    #[arg(long)]
    pub system_python: bool,

    /// Skip Python environment setup entirely.
    #[arg(long)]
    pub no_python: bool,

    /// The Python version to use for new environments.
    #[arg(long)]
    pub default_python_version: Option<String>,

    /// An existing `uv` virtual environment to use.
    #[arg(long)]
    pub uv_venv: Option<String>,

    /// An optional dependency group to install with `uv`. May be repeated.
    #[arg(long = "uv-extra", value_name = "EXTRA")]
    pub uv_extras: Vec<String>,

    /// Install every optional dependency group with `uv`.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub uv_all_extras: Option<bool>,

    /// The PyTorch backend `uv` installs, such as `cu128`.
    #[arg(long)]
    pub uv_torch_backend: Option<String>,

    /// The name or path of the `conda` environment to use.
    #[arg(long)]
    pub conda_env: Option<String>,

    /// A `conda` environment file, relative to the repository root.
    #[arg(long)]
    pub conda_file: Option<String>,

    /// A command that replaces the default dependency installation.
    #[arg(long)]
    pub install: Option<String>,

    /// A command run after cloning the source, before Python setup.
    #[arg(long)]
    pub pre_setup: Option<String>,

    /// A command run after all setup, before the job's command.
    #[arg(long)]
    pub post_setup: Option<String>,

    /// How the command is executed: `exec` or `bash`.
    #[arg(long, default_value = "exec")]
    pub exec_method: ExecMethod,

    /// Skip configuring NCCL for the cluster's network.
    #[arg(long)]
    pub skip_nccl_setup: bool,

    /// The directory results are written to in the container.
    #[arg(long)]
    pub results: Option<String>,

    /// The directory the source is cloned to in the container.
    #[arg(long)]
    pub runtime_dir: Option<String>,

    /// The job's scheduling priority.
    #[arg(long)]
    pub priority: Option<String>,

    /// Whether the job may be preempted. Defaults to preemptible when no
    /// cluster is given.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub preemptible: Option<bool>,

    /// How many times the service retries a failed job.
    #[arg(long)]
    pub retries: Option<u32>,

    /// The maximum run time of the task, such as `2h`.
    #[arg(long)]
    pub task_timeout: Option<String>,

    /// The commit to run. Defaults to the checked out commit.
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// The remote branch containing the commit. Defaults to the branch the
    /// checked out branch tracks.
    #[arg(long)]
    pub branch: Option<String>,

    /// Run a commit of a GitHub repository instead of the local checkout.
    #[arg(long, requires = "git_ref")]
    pub remote: Option<String>,

    /// Allow submitting with uncommitted changes.
    #[arg(long)]
    pub allow_dirty: bool,

    /// The name of the secret holding a GitHub token.
    #[arg(long)]
    pub gh_token_secret: Option<String>,

    /// A secret holding an AWS config file.
    #[arg(long)]
    pub aws_config_secret: Option<String>,

    /// A secret holding an AWS credentials file.
    #[arg(long)]
    pub aws_credentials_secret: Option<String>,

    /// A secret holding Google Cloud credentials.
    #[arg(long)]
    pub google_credentials_secret: Option<String>,

    /// Stream the job's logs until it finishes.
    #[arg(long, overrides_with = "no_logs")]
    pub show_logs: bool,

    /// Do not stream the job's logs.
    #[arg(long)]
    pub no_logs: bool,

    /// Seconds to wait for the job to finish: `-1` waits indefinitely and `0`
    /// returns after submission. Defaults to `0` unless logs are shown.
    #[arg(long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Seconds to wait for the job to start.
    #[arg(long)]
    pub start_timeout: Option<u64>,

    /// Seconds to wait for new log lines.
    #[arg(long)]
    pub inactive_timeout: Option<u64>,

    /// Cancel the job when a timeout expires.
    #[arg(long)]
    pub auto_cancel: bool,

    /// A Slack incoming webhook to notify about the job while it is followed.
    #[arg(long, value_name = "URL")]
    pub slack_webhook_url: Option<String>,

    /// Print the job specification instead of submitting it.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the job specification to a file.
    #[arg(long, value_name = "PATH")]
    pub save_spec: Option<PathBuf>,

    /// The command to run, after `--`.
    #[arg(last = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

/// The main function for the `run` subcommand.
pub async fn run(args: Args, config: Config) -> CommandResult {
    if args.args.is_empty() {
        return Err(CommandError::invalid(anyhow!(
            "a command is required, for example: gantry run -- python -c 'print(\"Hello, World!\")'"
        )));
    }

    let follow = follow_options(&args, &config).map_err(CommandError::invalid)?;
    let git = resolve_source(&args).map_err(CommandError::invalid)?;

    let public = match git.is_public().await {
        Ok(public) => public,
        Err(e) => {
            warn!(
                "failed to determine if `{repo}` is public, assuming it is private: {e:#}",
                repo = git.repo
            );
            false
        }
    };

    let gh_token_secret = args
        .gh_token_secret
        .clone()
        .unwrap_or_else(|| config.gh_token_secret.clone());
    let request = build_request(
        &args,
        &config,
        &git,
        (!public).then_some(gh_token_secret.as_str()),
    )
    .map_err(CommandError::invalid)?;
    let name = args.name.clone().unwrap_or_else(generate_job_name);

    if let Some(path) = &args.save_spec {
        save_spec(path, &request)?;
        println!("job specification saved to `{path}`", path = path.display());
    }

    if args.dry_run {
        println!("name: {name}");
        println!(
            "{spec}",
            spec = serde_json::to_string_pretty(&request).context("failed to serialize job")?
        );
        return Ok(());
    }

    let service = HttpJobService::new(&config.service)?;
    check_secrets(&service, &request, &gh_token_secret).await?;

    info!(name = %name, workspace = %request.workspace, "submitting job");
    let handle = submit_unique(&service, &name, &request)
        .await
        .context("failed to submit job")?;

    println!("job: {handle}");
    println!("workspace: {workspace}", workspace = request.workspace);
    println!("commit: {url}", url = git.ref_url());
    if let Some(branch) = &git.branch {
        println!("branch: {branch}");
    }

    let Some(options) = follow else {
        return Ok(());
    };

    let info = attach(
        &service,
        &handle,
        &options,
        &mut std::io::stdout(),
        shutdown_signal(),
    )
    .await
    .map_err(|e| CommandError::from(anyhow::Error::from(e)))?;
    report(&info)
}

/// Determines how the job is followed after submission.
///
/// Returns `None` when the command should return right after submitting.
fn follow_options(args: &Args, config: &Config) -> Result<Option<FollowOptions>> {
    let show_logs = match (args.show_logs, args.no_logs) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    let timeout = match args.timeout {
        Some(t) if t < -1 => bail!("`--timeout` must be -1, 0, or a positive number of seconds"),
        Some(t) => t,
        None if show_logs == Some(true) => -1,
        None => 0,
    };

    if timeout == 0 {
        if show_logs == Some(true) {
            bail!("`--show-logs` cannot be used with `--timeout=0`");
        }
        return Ok(None);
    }

    let secs = |s: u64| Duration::from_secs(s);
    Ok(Some(FollowOptions {
        show_logs: show_logs.unwrap_or(true),
        timeout: u64::try_from(timeout).ok().map(secs),
        start_timeout: args.start_timeout.map(secs),
        inactive_timeout: args.inactive_timeout.map(secs),
        auto_cancel: args.auto_cancel,
        tail: false,
        poll_interval: config.follow.poll_interval(),
        callbacks: Callbacks::configured(args.slack_webhook_url.as_deref(), &config.follow)?,
    }))
}

/// Resolves the revision the job runs.
fn resolve_source(args: &Args) -> Result<GitRepoState> {
    let git = match &args.remote {
        Some(url) => {
            GitRepoState::remote(url, args.git_ref.as_deref(), args.branch.as_deref())?
        }
        None => {
            let dir = std::env::current_dir().context("failed to get the current directory")?;
            GitRepoState::local(&dir, args.git_ref.as_deref(), args.branch.as_deref())?
        }
    };

    if git.is_dirty && args.git_ref.is_none() && !args.allow_dirty {
        bail!("you have uncommitted changes; use `--allow-dirty` to submit anyway");
    }

    Ok(git)
}

/// Writes the job specification to a file.
fn save_spec(path: &Path, request: &JobRequest) -> Result<()> {
    let spec = serde_json::to_string_pretty(request).context("failed to serialize job")?;
    std::fs::write(path, spec)
        .with_context(|| format!("failed to write `{path}`", path = path.display()))
}

/// Builds the job request.
///
/// `gh_token_secret` is given when the repository is private.
pub fn build_request(
    args: &Args,
    config: &Config,
    git: &GitRepoState,
    gh_token_secret: Option<&str>,
) -> Result<JobRequest> {
    if args.args.is_empty() {
        bail!("a command is required");
    }

    if args.torchrun && args.gpus.unwrap_or(0) == 0 {
        bail!("`--torchrun` requires `--gpus` to be a positive number");
    }

    let workspace = args
        .workspace
        .clone()
        .or_else(|| config.workspace.clone())
        .context("a workspace is required; use `--workspace` or set `workspace` in the configuration")?;

    let results = args
        .results
        .clone()
        .unwrap_or_else(|| config.run.results_dir.clone());
    let runtime_dir = args
        .runtime_dir
        .clone()
        .unwrap_or_else(|| config.run.runtime_dir.clone());
    for (option, path) in [("--results", &results), ("--runtime-dir", &runtime_dir)] {
        if !path.starts_with('/') {
            bail!("`{option}` must be an absolute path, got `{path}`");
        }
    }

    let image = match (&args.beaker_image, &args.docker_image) {
        (Some(_), Some(_)) => bail!("`--beaker-image` and `--docker-image` are mutually exclusive"),
        (Some(image), None) => Image::Beaker(image.clone()),
        (None, Some(image)) => Image::Docker(image.clone()),
        (None, None) => Image::Beaker(config.run.image.clone()),
    };

    let mut env = vec![
        EnvVar::value("GANTRY_VERSION", env!("CARGO_PKG_VERSION")),
        EnvVar::value("GITHUB_REPO", &git.repo),
        EnvVar::value("GIT_REF", &git.git_ref),
        EnvVar::value("GANTRY_TASK_NAME", &args.task_name),
        EnvVar::value("RESULTS_DIR", &results),
        EnvVar::value("GANTRY_RUNTIME_DIR", &runtime_dir),
        EnvVar::value("GANTRY_EXEC_METHOD", args.exec_method.to_string()),
    ];

    let replication = replication(args)?;
    if args.torchrun {
        env.push(EnvVar::value("GANTRY_USE_TORCHRUN", "1"));
        if replication.as_ref().is_some_and(|r| r.leader_selection) {
            let mut rng = rand::rng();
            env.push(EnvVar::value(
                "GANTRY_RDZV_ID",
                rng.random_range(0..1000u32).to_string(),
            ));
            env.push(EnvVar::value(
                "GANTRY_RDZV_PORT",
                rng.random_range(29_000..30_000u16).to_string(),
            ));
        }
    }

    if let Some(branch) = &git.branch {
        env.push(EnvVar::value("GIT_BRANCH", branch));
    }

    if args.skip_nccl_setup {
        env.push(EnvVar::value("GANTRY_SKIP_NCCL_SETUP", "1"));
    }

    python_env(args, config, git, &mut env)?;

    for (name, value) in [
        ("GANTRY_INSTALL_CMD", &args.install),
        ("GANTRY_PRE_SETUP_CMD", &args.pre_setup),
        ("GANTRY_POST_SETUP_CMD", &args.post_setup),
    ] {
        if let Some(value) = value {
            env.push(EnvVar::value(name, value));
        }
    }

    let (user_env, user_secrets) = user_env(args)?;
    if let Some(secret) = gh_token_secret
        && !user_secrets.iter().any(|e| e.name == "GITHUB_TOKEN")
    {
        env.push(EnvVar::secret("GITHUB_TOKEN", secret));
    }

    for (name, secret) in [
        ("GANTRY_AWS_CONFIG", &args.aws_config_secret),
        ("GANTRY_AWS_CREDENTIALS", &args.aws_credentials_secret),
        ("GANTRY_GOOGLE_CREDENTIALS", &args.google_credentials_secret),
    ] {
        if let Some(secret) = secret {
            env.push(EnvVar::secret(name, secret));
        }
    }

    env.extend(user_env);
    env.extend(user_secrets);

    let mut tags = args.tags.clone();
    let mounts = mounts(args, config, &mut tags)?;
    if let Some(interconnect) = args.interconnect
        && !tags.iter().any(|t| t == interconnect.tag())
    {
        tags.push(interconnect.tag().to_string());
    }

    let preemptible = match args.preemptible {
        None if args.clusters.is_empty() => Some(true),
        preemptible => preemptible,
    };

    let command = vec![
        format!("{ENTRYPOINT_MOUNT_DIR}/gantry"),
        "bootstrap".to_string(),
        "--".to_string(),
    ];

    Ok(JobRequest::builder()
        .workspace(workspace)
        .task_name(args.task_name.clone())
        .maybe_description(args.description.clone())
        .maybe_budget(args.budget.clone().or_else(|| config.budget.clone()))
        .groups(args.groups.clone())
        .image(image)
        .command(command)
        .arguments(args.args.clone())
        .resources(Resources {
            cpus: args.cpus,
            gpus: args.gpus,
            memory: args.memory.clone(),
            shared_memory: args.shared_memory.clone(),
        })
        .constraints(Constraints {
            clusters: args.clusters.clone(),
            gpu_types: args.gpu_types.clone(),
            tags,
            hostnames: args.hostnames.clone(),
        })
        .env(env)
        .mounts(mounts)
        .result_path(results)
        .maybe_priority(args.priority.clone())
        .maybe_preemptible(preemptible)
        .maybe_retries(args.retries.filter(|r| *r > 0))
        .maybe_timeout(args.task_timeout.clone())
        .maybe_replication(replication)
        .build())
}

/// Determines the replication settings.
fn replication(args: &Args) -> Result<Option<Replication>> {
    let replicas = match args.replicas {
        Some(n) if n <= 0 => bail!("`--replicas` must be a positive number, got {n}"),
        Some(n) if n > 1 => u32::try_from(n).context("`--replicas` is too large")?,
        _ => return Ok(None),
    };

    let leader_selection = args
        .leader_selection
        .unwrap_or(args.torchrun && args.host_networking != Some(false));
    let host_networking = args.host_networking.unwrap_or(leader_selection);

    let mut propagate_failure = args.propagate_failure;
    let mut propagate_preemption = args.propagate_preemption;
    let mut synchronized_start_timeout = args.synchronized_start_timeout.clone();
    if args.torchrun && leader_selection {
        let failure = *propagate_failure.get_or_insert(true);
        if propagate_preemption.is_none() && failure {
            propagate_preemption = Some(true);
        }
        synchronized_start_timeout
            .get_or_insert_with(|| DEFAULT_SYNCHRONIZED_START_TIMEOUT.to_string());
    }

    Ok(Some(Replication {
        replicas,
        leader_selection,
        host_networking,
        propagate_failure: propagate_failure.unwrap_or(false),
        propagate_preemption: propagate_preemption.unwrap_or(false),
        synchronized_start_timeout,
    }))
}

/// Adds the variables that configure Python setup.
fn python_env(
    args: &Args,
    config: &Config,
    git: &GitRepoState,
    env: &mut Vec<EnvVar>,
) -> Result<()> {
    if args.no_python {
        if args.python_manager.is_some()
            || args.system_python
            || args.uv_venv.is_some()
            || args.uv_all_extras.is_some()
            || !args.uv_extras.is_empty()
            || args.uv_torch_backend.is_some()
            || args.conda_env.is_some()
            || args.conda_file.is_some()
        {
            bail!("other Python options cannot be used with `--no-python`");
        }

        env.push(EnvVar::value("GANTRY_NO_PYTHON", "1"));
        return Ok(());
    }

    let in_tree = |paths: &[&str]| -> Result<Option<String>> {
        for path in paths {
            if git.is_in_tree(path)? {
                return Ok(Some(path.to_string()));
            }
        }
        Ok(None)
    };
    let has_project_file = in_tree(PROJECT_FILES)?.is_some();
    let conda_file_in_tree = in_tree(CONDA_FILES)?;

    if let Some(version) = args
        .default_python_version
        .as_ref()
        .or(config.run.default_python_version.as_ref())
    {
        env.push(EnvVar::value("GANTRY_DEFAULT_PYTHON_VERSION", version));
    }

    if args.system_python {
        env.push(EnvVar::value("GANTRY_USE_SYSTEM_PYTHON", "1"));
    }

    let manager = match args.python_manager.or(config.run.python_manager) {
        Some(manager) => manager,
        None if args.conda_env.is_some()
            || args.conda_file.is_some()
            || conda_file_in_tree.is_some() =>
        {
            PythonManager::Conda
        }
        None => PythonManager::Uv,
    };
    env.push(EnvVar::value("GANTRY_PYTHON_MANAGER", manager.to_string()));

    match manager {
        PythonManager::Uv => {
            if args.conda_env.is_some() || args.conda_file.is_some() {
                bail!("`--conda-*` options can only be used with `--python-manager=conda`");
            }

            if let Some(venv) = &args.uv_venv {
                if args.system_python {
                    bail!("`--system-python` cannot be used with `--uv-venv`");
                }
                env.push(EnvVar::value("GANTRY_UV_VENV", venv));
            }

            let all_extras = match args.uv_all_extras {
                Some(_) if !args.uv_extras.is_empty() => {
                    bail!("`--uv-all-extras` cannot be used with `--uv-extra`")
                }
                Some(all) => all,
                None => args.uv_extras.is_empty() && has_project_file,
            };

            if (all_extras || !args.uv_extras.is_empty()) && !has_project_file {
                bail!(
                    "`--uv-all-extras` and `--uv-extra` require a pyproject.toml, setup.py, or \
                     setup.cfg file"
                );
            }

            if all_extras {
                env.push(EnvVar::value("GANTRY_UV_ALL_EXTRAS", "1"));
            }

            if !args.uv_extras.is_empty() {
                env.push(EnvVar::value("GANTRY_UV_EXTRAS", args.uv_extras.join(" ")));
            }

            if let Some(backend) = &args.uv_torch_backend {
                env.push(EnvVar::value("UV_TORCH_BACKEND", backend));
            }
        }
        PythonManager::Conda => {
            if args.uv_venv.is_some()
                || !args.uv_extras.is_empty()
                || args.uv_all_extras.is_some()
                || args.uv_torch_backend.is_some()
            {
                bail!("`--uv-*` options can only be used with `--python-manager=uv`");
            }

            if let Some(conda_env) = &args.conda_env {
                if args.system_python {
                    bail!("`--system-python` cannot be used with `--conda-env`");
                }
                env.push(EnvVar::value("GANTRY_CONDA_ENV", conda_env));
            }

            if let Some(file) = args.conda_file.as_ref().or(conda_file_in_tree.as_ref()) {
                env.push(EnvVar::value("GANTRY_CONDA_FILE", file));
            }
        }
    }

    Ok(())
}

/// Parses the user's environment variables and secrets.
fn user_env(args: &Args) -> Result<(Vec<EnvVar>, Vec<EnvVar>)> {
    let mut names = HashSet::new();
    let mut vars = Vec::new();
    for spec in &args.env {
        let var = match spec.split_once('=') {
            Some((name, value)) => EnvVar::value(name, value),
            None => match std::env::var(spec) {
                Ok(value) => EnvVar::value(spec.as_str(), value),
                Err(_) => bail!("invalid `--env` value `{spec}`: expected `NAME=VALUE` or the name of a local variable"),
            },
        };

        check_env_name(&var.name)?;
        if !names.insert(var.name.clone()) {
            bail!("duplicate environment variable `{name}`", name = var.name);
        }
        vars.push(var);
    }

    let mut secret_names = HashSet::new();
    let mut secrets = Vec::new();
    for spec in &args.env_secrets {
        let (name, secret) = spec
            .split_once('=')
            .unwrap_or((spec.as_str(), spec.as_str()));
        check_env_name(name)?;
        if secret.is_empty() {
            bail!("invalid `--env-secret` value `{spec}`: the secret name is empty");
        }

        if !secret_names.insert(name.to_string()) {
            bail!("duplicate environment secret `{name}`");
        }

        if names.contains(name) {
            bail!("environment secret `{name}` conflicts with an environment variable of the same name");
        }
        secrets.push(EnvVar::secret(name, secret));
    }

    Ok((vars, secrets))
}

/// Checks that an environment variable name is valid.
fn check_env_name(name: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid environment variable name `{name}`");
    }
    Ok(())
}

/// Splits a `SOURCE:/mount/path` specification.
fn split_mount<'a>(option: &str, spec: &'a str) -> Result<(&'a str, &'a str)> {
    match spec.split_once(':') {
        Some((source, target)) if !source.is_empty() && target.starts_with('/') => {
            Ok((source, target))
        }
        _ => bail!("invalid `{option}` value `{spec}`: expected `SOURCE:/mount/path`"),
    }
}

/// Parses the job's mounts, adding the cluster tags they require.
fn mounts(args: &Args, config: &Config, tags: &mut Vec<String>) -> Result<Vec<Mount>> {
    let mut mounts = vec![Mount::Dataset {
        dataset: config.run.entrypoint_dataset.clone(),
        sub_path: None,
        mount_path: ENTRYPOINT_MOUNT_DIR.to_string(),
    }];

    for spec in &args.datasets {
        let parts: Vec<_> = spec.split(':').collect();
        let (dataset, sub_path, mount_path) = match parts.as_slice() {
            [dataset, mount] => (*dataset, None, *mount),
            [dataset, sub_path, mount] => (*dataset, Some(sub_path.to_string()), *mount),
            _ => bail!("invalid `--dataset` value `{spec}`: expected `NAME:/mount` or `NAME:sub/path:/mount`"),
        };

        if dataset.is_empty() || !mount_path.starts_with('/') {
            bail!("invalid `--dataset` value `{spec}`: expected `NAME:/mount` or `NAME:sub/path:/mount`");
        }

        mounts.push(Mount::Dataset {
            dataset: dataset.to_string(),
            sub_path,
            mount_path: mount_path.to_string(),
        });
    }

    for spec in &args.dataset_secrets {
        let (secret, mount_path) = split_mount("--dataset-secret", spec)?;
        mounts.push(Mount::Secret {
            secret: secret.to_string(),
            mount_path: mount_path.to_string(),
        });
    }

    for spec in &args.mounts {
        let (source, mount_path) = split_mount("--mount", spec)?;
        mounts.push(Mount::HostPath {
            source: source.to_string(),
            mount_path: mount_path.to_string(),
        });
    }

    for spec in &args.weka {
        let (bucket, mount_path) = split_mount("--weka", spec)?;
        mounts.push(Mount::Weka {
            bucket: bucket.to_string(),
            mount_path: mount_path.to_string(),
        });
    }

    if !args.weka.is_empty() && !tags.iter().any(|t| t == "storage:weka") {
        tags.push("storage:weka".to_string());
    }

    let mut paths = HashSet::new();
    for mount in &mounts {
        if !paths.insert(mount.mount_path()) {
            bail!("more than one mount uses the path `{path}`", path = mount.mount_path());
        }
    }

    Ok(mounts)
}

/// Checks that every secret the job refers to exists.
async fn check_secrets<S>(service: &S, request: &JobRequest, gh_token_secret: &str) -> CommandResult
where
    S: JobService + ?Sized,
{
    let env_secrets = request.env.iter().filter_map(|e| match &e.value {
        EnvValue::Secret(secret) => Some(secret.as_str()),
        EnvValue::Value(_) => None,
    });
    let mount_secrets = request.mounts.iter().filter_map(|m| match m {
        Mount::Secret { secret, .. } => Some(secret.as_str()),
        _ => None,
    });

    let mut checked = HashSet::new();
    for secret in env_secrets.chain(mount_secrets) {
        if !checked.insert(secret) {
            continue;
        }

        let exists = service
            .secret_exists(&request.workspace, secret)
            .await
            .with_context(|| format!("failed to look up secret `{secret}`"))?;
        if exists {
            continue;
        }

        if secret == gh_token_secret {
            return Err(CommandError::invalid(anyhow!(
                "the repository is private and workspace `{workspace}` has no GitHub token \
                 secret `{secret}`; create a token with the `repo` scope at \
                 https://github.com/settings/tokens/new and store it with `gantry config \
                 set-gh-token`",
                workspace = request.workspace
            )));
        }

        return Err(CommandError::invalid(anyhow!(
            "secret `{secret}` was not found in workspace `{workspace}`",
            workspace = request.workspace
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::client::test::FakeService;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["run", "--workspace", "ai2/example"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["--", "python", "train.py"]);
        Args::try_parse_from(argv).unwrap()
    }

    fn git() -> GitRepoState {
        GitRepoState::remote("https://github.com/allenai/example", Some("abc123"), None).unwrap()
    }

    fn request(extra: &[&str]) -> Result<JobRequest> {
        build_request(&parse(extra), &Config::default(), &git(), None)
    }

    fn env_names(request: &JobRequest) -> Vec<&str> {
        request.env.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn minimal_requests() {
        let request = request(&[]).unwrap();
        assert_eq!(request.workspace, "ai2/example");
        assert_eq!(request.command, ["/gantry/gantry", "bootstrap", "--"]);
        assert_eq!(request.arguments, ["python", "train.py"]);
        assert_eq!(request.result_path, "/results");
        assert_eq!(request.preemptible, Some(true));
        assert_eq!(request.replication, None);
        assert_eq!(request.env_value("GITHUB_REPO"), Some("allenai/example"));
        assert_eq!(request.env_value("GIT_REF"), Some("abc123"));
        assert_eq!(request.env_value("GANTRY_EXEC_METHOD"), Some("exec"));
        assert_eq!(request.env_value("GANTRY_PYTHON_MANAGER"), Some("uv"));
        assert_eq!(request.env_value("GANTRY_RUNTIME_DIR"), Some("/gantry-runtime"));
        assert_eq!(
            request.mounts[0],
            Mount::Dataset {
                dataset: "gantry/entrypoint".into(),
                sub_path: None,
                mount_path: "/gantry".into(),
            }
        );
        assert!(!env_names(&request).contains(&"GITHUB_TOKEN"));
    }

    #[test]
    fn workspaces_are_required() {
        let args = Args::try_parse_from(["run", "--", "echo"]).unwrap();
        let err = build_request(&args, &Config::default(), &git(), None).unwrap_err();
        assert!(err.to_string().contains("a workspace is required"));
    }

    #[test]
    fn private_repositories_get_a_token() {
        let args = parse(&[]);
        let secret = "GH_TOKEN_SECRET";
        let request = build_request(&args, &Config::default(), &git(), Some(secret)).unwrap();
        assert!(request.env.contains(&EnvVar::secret("GITHUB_TOKEN", "GH_TOKEN_SECRET")));

        // A user-supplied token takes precedence.
        let args = parse(&["--env-secret", "GITHUB_TOKEN=MY_TOKEN"]);
        let request = build_request(&args, &Config::default(), &git(), Some(secret)).unwrap();
        let tokens: Vec<_> = request
            .env
            .iter()
            .filter(|e| e.name == "GITHUB_TOKEN")
            .collect();
        assert_eq!(tokens, [&EnvVar::secret("GITHUB_TOKEN", "MY_TOKEN")]);
    }

    #[test]
    fn replicated_torchrun_jobs() {
        let request = request(&["--gpus", "8", "--replicas", "2", "--torchrun"]).unwrap();
        assert_eq!(
            request.replication,
            Some(Replication {
                replicas: 2,
                leader_selection: true,
                host_networking: true,
                propagate_failure: true,
                propagate_preemption: true,
                synchronized_start_timeout: Some("5m".into()),
            })
        );

        let id: u32 = request.env_value("GANTRY_RDZV_ID").unwrap().parse().unwrap();
        let port: u16 = request.env_value("GANTRY_RDZV_PORT").unwrap().parse().unwrap();
        assert!(id < 1000);
        assert!((29_000..30_000).contains(&port));
        assert_eq!(request.env_value("GANTRY_USE_TORCHRUN"), Some("1"));
    }

    #[test]
    fn replica_counts() {
        assert!(request(&["--replicas", "0"]).is_err());
        assert!(request(&["--replicas", "-2"]).is_err());
        assert_eq!(request(&["--replicas", "1"]).unwrap().replication, None);

        let replication = request(&["--replicas", "4"]).unwrap().replication.unwrap();
        assert!(!replication.leader_selection);
        assert!(!replication.host_networking);
        assert_eq!(replication.synchronized_start_timeout, None);
    }

    #[test]
    fn torchrun_requires_gpus() {
        let err = request(&["--torchrun"]).unwrap_err();
        assert!(err.to_string().contains("--gpus"));
    }

    #[test]
    fn python_options_are_checked() {
        for options in [
            &["--no-python", "--conda-env", "train"][..],
            &["--no-python", "--system-python"],
            &["--python-manager", "uv", "--conda-env", "train"],
            &["--python-manager", "conda", "--uv-venv", "/venv"],
            &["--system-python", "--uv-venv", "/venv"],
            &["--system-python", "--conda-env", "train"],
            &["--uv-all-extras"],
            &["--uv-extra", "dev"],
        ] {
            assert!(request(options).is_err(), "{options:?}");
        }

        let request = request(&["--no-python"]).unwrap();
        assert_eq!(request.env_value("GANTRY_NO_PYTHON"), Some("1"));
        assert_eq!(request.env_value("GANTRY_PYTHON_MANAGER"), None);
    }

    #[test]
    fn conda_is_chosen_for_conda_options() {
        let request = request(&["--conda-env", "train", "--conda-file", "env.yml"]).unwrap();
        assert_eq!(request.env_value("GANTRY_PYTHON_MANAGER"), Some("conda"));
        assert_eq!(request.env_value("GANTRY_CONDA_ENV"), Some("train"));
        assert_eq!(request.env_value("GANTRY_CONDA_FILE"), Some("env.yml"));
    }

    #[test]
    fn user_environment() {
        let request = request(&[
            "--env",
            "SEED=42",
            "--env",
            "EQUATION=a=b",
            "--env-secret",
            "WANDB_API_KEY",
            "--env-secret",
            "HF_TOKEN=hf-token",
            "--aws-config-secret",
            "aws-config",
        ])
        .unwrap();
        assert_eq!(request.env_value("SEED"), Some("42"));
        assert_eq!(request.env_value("EQUATION"), Some("a=b"));
        assert!(request.env.contains(&EnvVar::secret("WANDB_API_KEY", "WANDB_API_KEY")));
        assert!(request.env.contains(&EnvVar::secret("HF_TOKEN", "hf-token")));
        assert!(request.env.contains(&EnvVar::secret("GANTRY_AWS_CONFIG", "aws-config")));

        for options in [
            &["--env", "SEED=1", "--env", "SEED=2"][..],
            &["--env", "SEED=1", "--env-secret", "SEED=seed"],
            &["--env-secret", "A=x", "--env-secret", "A=y"],
            &["--env", "1BAD=x"],
            &["--env", "GANTRY_SURELY_UNSET_VARIABLE"],
        ] {
            assert!(self::request(options).is_err(), "{options:?}");
        }
    }

    #[test]
    fn mounts_and_tags() {
        let request = request(&[
            "--dataset",
            "ai2/data:/data",
            "--dataset",
            "ai2/models:checkpoints/step100:/models",
            "--dataset-secret",
            "ssh-key:/root/.ssh/id_ed25519",
            "--mount",
            "/net/nfs:/nfs",
            "--weka",
            "oe-training:/weka",
            "--interconnect",
            "ib",
            "--cluster",
            "ai2/jupiter",
        ])
        .unwrap();

        assert_eq!(request.mounts.len(), 6);
        assert_eq!(
            request.mounts[2],
            Mount::Dataset {
                dataset: "ai2/models".into(),
                sub_path: Some("checkpoints/step100".into()),
                mount_path: "/models".into(),
            }
        );
        assert_eq!(request.constraints.tags, ["storage:weka", "interconnect:ib"]);
        assert_eq!(request.constraints.clusters, ["ai2/jupiter"]);
        assert_eq!(request.preemptible, None);

        for options in [
            &["--dataset", "ai2/data"][..],
            &["--dataset", "ai2/data:relative"],
            &["--mount", "/a:/data", "--dataset", "ai2/data:/data"],
            &["--weka", "bucket"],
        ] {
            assert!(self::request(options).is_err(), "{options:?}");
        }
    }

    #[test]
    fn follow_defaults() {
        let config = Config::default();
        assert!(follow_options(&parse(&[]), &config).unwrap().is_none());

        let options = follow_options(&parse(&["--show-logs"]), &config)
            .unwrap()
            .unwrap();
        assert!(options.show_logs);
        assert_eq!(options.timeout, None);

        let options = follow_options(&parse(&["--timeout", "60", "--no-logs"]), &config)
            .unwrap()
            .unwrap();
        assert!(!options.show_logs);
        assert_eq!(options.timeout, Some(Duration::from_secs(60)));

        assert!(follow_options(&parse(&["--show-logs", "--timeout", "0"]), &config).is_err());
    }

    #[tokio::test]
    async fn missing_secrets_are_invalid() {
        let service = FakeService::with_statuses(&[]);
        let secret = "GITHUB_TOKEN";
        let request =
            build_request(&parse(&[]), &Config::default(), &git(), Some(secret)).unwrap();

        let err = check_secrets(&service, &request, secret).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("gantry config set-gh-token"));

        service.secrets.lock().unwrap().push(secret.to_string());
        check_secrets(&service, &request, secret).await.unwrap();
    }
}
