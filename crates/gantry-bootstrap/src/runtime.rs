//! Construction of the Python runtime environment.
//!
//! Two interchangeable backends construct the environment: the fast path
//! (`uv`) creates a self-contained virtual environment, while the general
//! path (`conda`) manages named environments that can be described by a full
//! environment file. Both go through the same states:
//!
//! ```text
//! select construction -> create or reuse -> activate -> install -> export
//! ```
//!
//! The construction is chosen once, up front, and every precondition is
//! checked before anything is created.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use tracing::info;

use crate::Result;
use crate::context::PythonManager;
use crate::context::PythonSettings;
use crate::environment::ProcessEnvironment;
use crate::logs::GANTRY_DIR_NAME;
use crate::logs::LogCapture;
use crate::tools::ToolInstaller;

pub mod conda;
mod install;
pub mod uv;

pub use install::DependencyManifest;
pub use install::Installation;

/// The name of the frozen package list written to the results directory.
pub const FROZEN_REQUIREMENTS: &str = "requirements.txt";

/// The name of the exported environment file written by the general path.
pub const EXPORTED_ENVIRONMENT: &str = "environment.yml";

/// The backend used to construct the runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    /// The self-contained `uv` backend.
    FastPath,
    /// The `conda` backend.
    GeneralPath,
}

impl From<PythonManager> for RuntimeBackend {
    fn from(manager: PythonManager) -> Self {
        match manager {
            PythonManager::Uv => Self::FastPath,
            PythonManager::Conda => Self::GeneralPath,
        }
    }
}

impl fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastPath => write!(f, "uv"),
            Self::GeneralPath => write!(f, "conda"),
        }
    }
}

/// How the runtime environment is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Construction {
    /// Reuse an environment given by name or path.
    UseExisting(String),
    /// Use the interpreter already on `PATH`.
    UseSystem,
    /// Create an environment from a full environment file.
    CreateFromManifest(PathBuf),
    /// Create an environment with a specific Python version.
    CreateWithVersion(String),
    /// Create an environment with the backend's default Python.
    CreateDefault,
}

impl Construction {
    /// Selects the construction for a backend.
    ///
    /// `checkout` is the cloned source, which is searched for environment
    /// files. A configured environment file that does not exist is an error.
    pub fn select(
        backend: RuntimeBackend,
        settings: &PythonSettings,
        checkout: &Path,
    ) -> Result<Self> {
        let existing = match backend {
            RuntimeBackend::FastPath => settings
                .uv_venv
                .as_ref()
                .map(|p| p.display().to_string()),
            RuntimeBackend::GeneralPath => settings.conda_env.clone(),
        };
        if let Some(existing) = existing {
            return Ok(Self::UseExisting(existing));
        }

        if settings.use_system {
            return Ok(Self::UseSystem);
        }

        if backend == RuntimeBackend::GeneralPath
            && let Some(manifest) = conda::environment_file(settings, checkout)?
        {
            return Ok(Self::CreateFromManifest(manifest));
        }

        match &settings.version {
            Some(version) => Ok(Self::CreateWithVersion(version.clone())),
            None => Ok(Self::CreateDefault),
        }
    }
}

/// How the runtime environment came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    /// An existing environment was reused.
    Reused,
    /// A new environment was created from an environment file.
    CreatedFromManifest,
    /// A new environment was created without an environment file.
    CreatedEmpty,
    /// No environment was created; the system interpreter is used.
    System,
}

/// The constructed runtime environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    /// The backend that constructed the environment.
    pub backend: RuntimeBackend,
    /// How the environment came to be.
    pub kind: EnvironmentKind,
    /// The environment's prefix, if one was created or reused.
    pub prefix: Option<PathBuf>,
    /// How dependencies were installed.
    pub installation: Installation,
}

/// Constructs the runtime environment, installs the project's dependencies,
/// and makes the checkout importable.
///
/// The frozen package list is written to the `.gantry` directory inside
/// `results_dir`.
pub async fn construct_runtime(
    settings: &PythonSettings,
    checkout: &Path,
    results_dir: &Path,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    tools: &ToolInstaller<'_>,
) -> Result<RuntimeEnvironment> {
    let backend = RuntimeBackend::from(settings.manager);
    let construction = Construction::select(backend, settings, checkout)?;
    info!(%backend, ?construction, "constructing Python environment");

    let (kind, prefix) = match backend {
        RuntimeBackend::FastPath => {
            uv::construct(&construction, checkout, env, logs, tools).await?
        }
        RuntimeBackend::GeneralPath => {
            conda::construct(&construction, settings, checkout, env, logs, tools).await?
        }
    };

    let installation =
        install::install_dependencies(backend, settings, checkout, env, logs).await?;

    env.append_path("PYTHONPATH", checkout);

    let gantry_dir = results_dir.join(GANTRY_DIR_NAME);
    match backend {
        RuntimeBackend::FastPath => uv::freeze(&gantry_dir, checkout, env, logs).await?,
        RuntimeBackend::GeneralPath => conda::freeze(&gantry_dir, checkout, env, logs).await?,
    }

    let runtime = RuntimeEnvironment {
        backend,
        kind,
        prefix,
        installation,
    };
    info!(?runtime, "Python environment ready");
    Ok(runtime)
}

/// Writes command output to a file in the results directory.
async fn write_artifact(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.map_err(|e| {
        crate::BootstrapError::io(format!("failed to write `{}`", path.display()), e)
    })
}
