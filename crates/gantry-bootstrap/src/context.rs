//! The bootstrap context read from the container's environment.
//!
//! The scheduler passes every job parameter to the container as an
//! environment variable. [`BootstrapContext::from_env`] reads and validates
//! all of them at once, before any other stage runs, so that a misconfigured
//! job fails without touching the network or the filesystem.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::BootstrapError;
use crate::Result;
use crate::environment::ProcessEnvironment;
use crate::payload::ExecMethod;

/// The runtime directory used when `GANTRY_RUNTIME_DIR` is unset.
pub const DEFAULT_RUNTIME_DIR: &str = "/gantry-runtime";

/// The name of the general-purpose environment created when none is named.
pub const DEFAULT_CONDA_ENV: &str = "gantry";

/// The package manager used to construct the Python environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PythonManager {
    /// The `uv` package manager.
    #[default]
    Uv,
    /// The `conda` package manager.
    Conda,
}

impl FromStr for PythonManager {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uv" => Ok(Self::Uv),
            "conda" => Ok(Self::Conda),
            _ => Err("expected `uv` or `conda`".to_string()),
        }
    }
}

/// How to treat an installer that does not belong to the active interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Log a warning and continue.
    #[default]
    Warn,
    /// Abort the bootstrap.
    Error,
}

impl FromStr for MismatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err("expected `warn` or `error`".to_string()),
        }
    }
}

/// The identity of the node and replica the container runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// The hostname of the node.
    pub hostname: String,
    /// The scheduler's identifier for the node.
    pub id: String,
    /// The number of accelerators assigned to the container.
    pub gpus: u32,
    /// The total number of replicas in the job, if replicated.
    pub replica_count: Option<u32>,
    /// The rank of this replica, if replicated.
    pub replica_rank: Option<u32>,
    /// The hostname of the leader replica, if one was selected.
    pub leader_hostname: Option<String>,
}

impl NodeIdentity {
    /// Determines if this is one node of a multi-node accelerated job.
    pub fn is_multi_node_accelerated(&self) -> bool {
        self.replica_count.is_some_and(|n| n > 1)
            && self.leader_hostname.is_some()
            && self.gpus > 0
    }
}

/// Settings for the Python environment construction stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PythonSettings {
    /// The package manager backend to use.
    pub manager: PythonManager,
    /// The Python version to request when creating an environment.
    pub version: Option<String>,
    /// Use the interpreter already on `PATH` instead of creating one.
    pub use_system: bool,
    /// An existing `uv` virtual environment to use.
    pub uv_venv: Option<PathBuf>,
    /// Optional dependency groups to install.
    pub uv_extras: Vec<String>,
    /// Install all optional dependency groups.
    pub uv_all_extras: bool,
    /// The name or prefix path of the `conda` environment to use.
    pub conda_env: Option<String>,
    /// A `conda` environment file, relative to the checkout.
    pub conda_file: Option<PathBuf>,
    /// A command (or script path) that replaces dependency installation.
    pub install_cmd: Option<String>,
    /// How to treat an installer/interpreter prefix mismatch.
    pub prefix_mismatch: MismatchPolicy,
}

/// Settings for the distributed launcher wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendezvous {
    /// The rendezvous identifier.
    pub id: u32,
    /// The rendezvous port on the leader.
    pub port: u16,
}

/// Cloud credentials to write to well-known locations.
#[derive(Debug, Default)]
pub struct Credentials {
    /// Contents of the AWS config file.
    pub aws_config: Option<SecretString>,
    /// Contents of the AWS credentials file.
    pub aws_credentials: Option<SecretString>,
    /// Contents of a Google Cloud service account key.
    pub google_credentials: Option<SecretString>,
}

/// Everything the bootstrap procedure needs to know about its job.
#[derive(Debug)]
pub struct BootstrapContext {
    /// The repository to clone, as `owner/name` or a URL/path.
    pub repo: String,
    /// The revision to check out.
    pub git_ref: String,
    /// The branch containing the revision, if known.
    pub branch: Option<String>,
    /// The token used to clone private repositories.
    pub github_token: Option<SecretString>,
    /// The directory results are written to.
    pub results_dir: PathBuf,
    /// The directory the source is checked out into.
    pub runtime_dir: PathBuf,
    /// The node and replica identity.
    pub node: NodeIdentity,
    /// How to execute the payload.
    pub exec_method: ExecMethod,
    /// Wrap the payload with the distributed launcher.
    pub use_torchrun: bool,
    /// The rendezvous parameters for the distributed launcher.
    pub rendezvous: Option<Rendezvous>,
    /// Skip accelerator network configuration.
    pub skip_nccl_setup: bool,
    /// Python settings, or `None` when Python setup is disabled.
    pub python: Option<PythonSettings>,
    /// A command run after cloning, before environment construction.
    pub pre_setup: Option<String>,
    /// A command run after accelerator configuration.
    pub post_setup: Option<String>,
    /// Cloud credentials.
    pub credentials: Credentials,
    /// The version of the launcher that submitted the job.
    pub launcher_version: Option<String>,
    /// The name of the task.
    pub task_name: Option<String>,
}

impl BootstrapContext {
    /// Reads and validates the context from an environment.
    pub fn from_env(env: &ProcessEnvironment) -> Result<Self> {
        let repo = required(env, "GITHUB_REPO")?;
        let git_ref = required(env, "GIT_REF")?;
        let results_dir = PathBuf::from(required(env, "RESULTS_DIR")?);
        let node = NodeIdentity {
            hostname: required(env, "BEAKER_NODE_HOSTNAME")?,
            id: required(env, "BEAKER_NODE_ID")?,
            gpus: parse(
                "BEAKER_ASSIGNED_GPU_COUNT",
                &required(env, "BEAKER_ASSIGNED_GPU_COUNT")?,
            )?,
            replica_count: optional_parse(env, "BEAKER_REPLICA_COUNT")?,
            replica_rank: optional_parse(env, "BEAKER_REPLICA_RANK")?,
            leader_hostname: optional(env, "BEAKER_LEADER_REPLICA_HOSTNAME"),
        };

        let runtime_dir = optional(env, "GANTRY_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR));
        check_runtime_dir(&runtime_dir, &results_dir)?;

        let exec_method = optional_parse(env, "GANTRY_EXEC_METHOD")?.unwrap_or_default();
        let use_torchrun = flag(env, "GANTRY_USE_TORCHRUN");
        let rendezvous = match (
            optional_parse::<u32>(env, "GANTRY_RDZV_ID")?,
            optional_parse::<u16>(env, "GANTRY_RDZV_PORT")?,
        ) {
            (Some(id), Some(port)) => Some(Rendezvous { id, port }),
            _ => None,
        };

        if use_torchrun && node.is_multi_node_accelerated() {
            if rendezvous.is_none() {
                return Err(BootstrapError::Precondition(
                    "`GANTRY_RDZV_ID` and `GANTRY_RDZV_PORT` are required to launch a \
                     multi-node job with torchrun"
                        .to_string(),
                ));
            }

            if node.replica_rank.is_none() {
                return Err(BootstrapError::MissingVariable("BEAKER_REPLICA_RANK"));
            }
        }

        let python = if flag(env, "GANTRY_NO_PYTHON") {
            None
        } else {
            Some(python_settings(env, &runtime_dir)?)
        };

        Ok(Self {
            repo,
            git_ref,
            branch: optional(env, "GIT_BRANCH"),
            github_token: optional(env, "GITHUB_TOKEN").map(SecretString::from),
            results_dir,
            runtime_dir,
            node,
            exec_method,
            use_torchrun,
            rendezvous,
            skip_nccl_setup: flag(env, "GANTRY_SKIP_NCCL_SETUP"),
            python,
            pre_setup: optional(env, "GANTRY_PRE_SETUP_CMD"),
            post_setup: optional(env, "GANTRY_POST_SETUP_CMD"),
            credentials: Credentials {
                aws_config: optional(env, "GANTRY_AWS_CONFIG").map(SecretString::from),
                aws_credentials: optional(env, "GANTRY_AWS_CREDENTIALS").map(SecretString::from),
                google_credentials: optional(env, "GANTRY_GOOGLE_CREDENTIALS")
                    .map(SecretString::from),
            },
            launcher_version: optional(env, "GANTRY_VERSION"),
            task_name: optional(env, "GANTRY_TASK_NAME"),
        })
    }

    /// Gets the URL the repository is cloned from.
    ///
    /// Repository identifiers of the form `owner/name` are hosted on GitHub;
    /// anything that already looks like a URL or an absolute path is used as
    /// is.
    pub fn remote_url(&self) -> String {
        if self.repo.contains("://") || self.repo.starts_with('/') {
            self.repo.clone()
        } else {
            format!("https://github.com/{repo}", repo = self.repo)
        }
    }
}

/// Reads the Python settings.
///
/// An existing virtual environment must live outside the runtime directory,
/// which is emptied before the repository is cloned.
fn python_settings(env: &ProcessEnvironment, runtime_dir: &Path) -> Result<PythonSettings> {
    let settings = PythonSettings {
        manager: optional_parse(env, "GANTRY_PYTHON_MANAGER")?.unwrap_or_default(),
        version: optional(env, "GANTRY_DEFAULT_PYTHON_VERSION"),
        use_system: flag(env, "GANTRY_USE_SYSTEM_PYTHON"),
        uv_venv: optional(env, "GANTRY_UV_VENV").map(PathBuf::from),
        uv_extras: optional(env, "GANTRY_UV_EXTRAS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        uv_all_extras: flag(env, "GANTRY_UV_ALL_EXTRAS"),
        conda_env: optional(env, "GANTRY_CONDA_ENV"),
        conda_file: optional(env, "GANTRY_CONDA_FILE").map(PathBuf::from),
        install_cmd: optional(env, "GANTRY_INSTALL_CMD"),
        prefix_mismatch: optional_parse(env, "GANTRY_PIP_PREFIX_MISMATCH")?.unwrap_or_default(),
    };

    if settings.use_system && (settings.uv_venv.is_some() || settings.conda_env.is_some()) {
        return Err(BootstrapError::Precondition(
            "`GANTRY_USE_SYSTEM_PYTHON` cannot be combined with an existing environment"
                .to_string(),
        ));
    }

    match settings.manager {
        PythonManager::Uv => {
            if let Some(venv) = &settings.uv_venv
                && venv.starts_with(runtime_dir)
            {
                return Err(BootstrapError::InvalidVariable {
                    name: "GANTRY_UV_VENV",
                    value: venv.display().to_string(),
                    reason: format!(
                        "the virtual environment must not be inside the runtime directory `{}`",
                        runtime_dir.display()
                    ),
                });
            }

            if let Some(venv) = &settings.uv_venv
                && !venv.is_dir()
            {
                return Err(BootstrapError::Precondition(format!(
                    "virtual environment `{venv}` given by `GANTRY_UV_VENV` does not exist",
                    venv = venv.display()
                )));
            }
        }
        PythonManager::Conda => {
            if let Some(name) = &settings.conda_env
                && name.contains('/')
                && !Path::new(name).is_dir()
            {
                return Err(BootstrapError::Precondition(format!(
                    "conda environment `{name}` given by `GANTRY_CONDA_ENV` looks like a path \
                     but does not exist"
                )));
            }
        }
    }

    Ok(settings)
}

/// Ensures the checkout directory is separate from the results directory.
fn check_runtime_dir(runtime_dir: &Path, results_dir: &Path) -> Result<()> {
    if !runtime_dir.is_absolute() {
        return Err(BootstrapError::InvalidVariable {
            name: "GANTRY_RUNTIME_DIR",
            value: runtime_dir.display().to_string(),
            reason: "the path must be absolute".to_string(),
        });
    }

    if runtime_dir.starts_with(results_dir) || results_dir.starts_with(runtime_dir) {
        return Err(BootstrapError::InvalidVariable {
            name: "GANTRY_RUNTIME_DIR",
            value: runtime_dir.display().to_string(),
            reason: format!(
                "the runtime directory must not overlap the results directory `{}`",
                results_dir.display()
            ),
        });
    }

    Ok(())
}

/// Reads a required, non-empty variable.
fn required(env: &ProcessEnvironment, name: &'static str) -> Result<String> {
    env.get_non_empty(name)
        .map(str::to_string)
        .ok_or(BootstrapError::MissingVariable(name))
}

/// Reads an optional variable, treating empty as unset.
fn optional(env: &ProcessEnvironment, name: &str) -> Option<String> {
    env.get_non_empty(name).map(str::to_string)
}

/// Reads a boolean flag; any non-empty value other than `0`/`false` is set.
fn flag(env: &ProcessEnvironment, name: &str) -> bool {
    env.get_non_empty(name)
        .is_some_and(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false"))
}

/// Parses a variable's value.
fn parse<T>(name: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| BootstrapError::InvalidVariable {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Parses an optional variable's value.
fn optional_parse<T>(env: &ProcessEnvironment, name: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env.get_non_empty(name).map(|v| parse(name, v)).transpose()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    const REQUIRED: &[(&str, &str)] = &[
        ("GITHUB_REPO", "allenai/gantry"),
        ("GIT_REF", "0123abcd"),
        ("RESULTS_DIR", "/results"),
        ("BEAKER_NODE_HOSTNAME", "node-1"),
        ("BEAKER_NODE_ID", "01HNODE"),
        ("BEAKER_ASSIGNED_GPU_COUNT", "0"),
    ];

    fn env_with(extra: &[(&str, &str)]) -> ProcessEnvironment {
        ProcessEnvironment::from_vars(REQUIRED.iter().chain(extra).copied())
    }

    #[test]
    fn minimal_context() {
        let ctx = BootstrapContext::from_env(&env_with(&[])).unwrap();
        assert_eq!(ctx.repo, "allenai/gantry");
        assert_eq!(ctx.remote_url(), "https://github.com/allenai/gantry");
        assert_eq!(ctx.runtime_dir, PathBuf::from(DEFAULT_RUNTIME_DIR));
        assert_eq!(ctx.exec_method, ExecMethod::Exec);
        assert_eq!(ctx.python, Some(PythonSettings::default()));
        assert!(!ctx.node.is_multi_node_accelerated());
    }

    #[test]
    fn each_required_variable_is_checked() {
        for (missing, _) in REQUIRED {
            for value in [None, Some("")] {
                let mut env = env_with(&[]);
                match value {
                    Some(v) => env.set(*missing, v),
                    None => {
                        env.remove(missing);
                    }
                }

                match BootstrapContext::from_env(&env) {
                    Err(BootstrapError::MissingVariable(name)) => assert_eq!(name, *missing),
                    other => panic!("expected `{missing}` to be reported, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn runtime_dir_must_not_be_in_results() {
        let err =
            BootstrapContext::from_env(&env_with(&[("GANTRY_RUNTIME_DIR", "/results/src")]))
                .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::InvalidVariable {
                name: "GANTRY_RUNTIME_DIR",
                ..
            }
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = BootstrapContext::from_env(&env_with(&[("GANTRY_PYTHON_MANAGER", "pip")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "environment variable `GANTRY_PYTHON_MANAGER` has invalid value `pip`: expected `uv` \
             or `conda`"
        );

        let err = BootstrapContext::from_env(&env_with(&[("BEAKER_REPLICA_COUNT", "two")]))
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::InvalidVariable {
                name: "BEAKER_REPLICA_COUNT",
                ..
            }
        ));
    }

    #[test]
    fn path_like_environments_must_exist() {
        let err = BootstrapContext::from_env(&env_with(&[
            ("GANTRY_PYTHON_MANAGER", "conda"),
            ("GANTRY_CONDA_ENV", "/opt/conda/envs/does-not-exist"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Precondition(_)));

        let err = BootstrapContext::from_env(&env_with(&[(
            "GANTRY_UV_VENV",
            "/does/not/exist/.venv",
        )]))
        .unwrap_err();
        assert!(matches!(err, BootstrapError::Precondition(_)));

        // A bare name is resolved by conda itself.
        let ctx = BootstrapContext::from_env(&env_with(&[
            ("GANTRY_PYTHON_MANAGER", "conda"),
            ("GANTRY_CONDA_ENV", "train"),
        ]))
        .unwrap();
        assert_eq!(ctx.python.unwrap().conda_env.as_deref(), Some("train"));
    }

    #[test]
    fn venvs_inside_the_runtime_dir_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("runtime");
        let venv = runtime.join(".venv");
        std::fs::create_dir_all(&venv).unwrap();

        let err = BootstrapContext::from_env(&env_with(&[
            ("GANTRY_RUNTIME_DIR", runtime.to_str().unwrap()),
            ("GANTRY_UV_VENV", venv.to_str().unwrap()),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::InvalidVariable {
                name: "GANTRY_UV_VENV",
                ..
            }
        ));

        let outside = dir.path().join("venv");
        std::fs::create_dir_all(&outside).unwrap();
        let ctx = BootstrapContext::from_env(&env_with(&[
            ("GANTRY_RUNTIME_DIR", runtime.to_str().unwrap()),
            ("GANTRY_UV_VENV", outside.to_str().unwrap()),
        ]))
        .unwrap();
        assert_eq!(ctx.python.unwrap().uv_venv, Some(outside));
    }

    #[test]
    fn multi_node_torchrun_needs_rendezvous() {
        let multi_node = [
            ("BEAKER_ASSIGNED_GPU_COUNT", "8"),
            ("BEAKER_REPLICA_COUNT", "2"),
            ("BEAKER_REPLICA_RANK", "1"),
            ("BEAKER_LEADER_REPLICA_HOSTNAME", "leader"),
            ("GANTRY_USE_TORCHRUN", "1"),
        ];
        let err = BootstrapContext::from_env(&env_with(&multi_node)).unwrap_err();
        assert!(matches!(err, BootstrapError::Precondition(_)));

        let mut vars = multi_node.to_vec();
        vars.extend([("GANTRY_RDZV_ID", "42"), ("GANTRY_RDZV_PORT", "29400")]);
        let ctx = BootstrapContext::from_env(&env_with(&vars)).unwrap();
        assert!(ctx.node.is_multi_node_accelerated());
        assert_eq!(ctx.rendezvous, Some(Rendezvous { id: 42, port: 29400 }));
    }

    #[test]
    fn no_python_disables_settings() {
        let ctx = BootstrapContext::from_env(&env_with(&[("GANTRY_NO_PYTHON", "1")])).unwrap();
        assert_eq!(ctx.python, None);
    }
}
