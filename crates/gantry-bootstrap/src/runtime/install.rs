//! Installation of the project's dependencies.

use std::path::Path;

use tokio::process::Command;
use tracing::info;
use tracing::warn;

use super::RuntimeBackend;
use crate::BootstrapError;
use crate::Result;
use crate::context::PythonSettings;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::retry::RetryPolicy;
use crate::retry::with_retries;

/// A file in the checkout describing the project's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyManifest {
    /// `pyproject.toml`.
    Project,
    /// `setup.py`.
    LegacyBuild,
    /// `requirements.txt`.
    PackageList,
    /// `pylock.toml`.
    Pinned,
}

impl DependencyManifest {
    /// Every manifest, in the order they are looked for.
    pub const PRIORITY: [Self; 4] = [
        Self::Project,
        Self::LegacyBuild,
        Self::PackageList,
        Self::Pinned,
    ];

    /// Gets the file name of the manifest.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Project => "pyproject.toml",
            Self::LegacyBuild => "setup.py",
            Self::PackageList => "requirements.txt",
            Self::Pinned => "pylock.toml",
        }
    }

    /// Finds the highest priority manifest in a directory.
    pub fn detect(dir: &Path) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|m| dir.join(m.file_name()).is_file())
    }
}

/// How the project's dependencies were installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Installation {
    /// A user-supplied command replaced the default installation.
    Override(String),
    /// Dependencies were installed from a manifest.
    Manifest(DependencyManifest),
    /// No manifest was found; nothing was installed.
    Nothing,
}

/// Installs the project's dependencies into the active environment.
pub(super) async fn install_dependencies(
    backend: RuntimeBackend,
    settings: &PythonSettings,
    checkout: &Path,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
) -> Result<Installation> {
    if let Some(cmd) = &settings.install_cmd {
        run_override(cmd, checkout, env, logs).await?;
        return Ok(Installation::Override(cmd.clone()));
    }

    let Some(manifest) = DependencyManifest::detect(checkout) else {
        info!("no dependency manifest found; skipping installation");
        return Ok(Installation::Nothing);
    };

    let Some(args) = install_args(backend, settings, manifest) else {
        warn!(
            manifest = manifest.file_name(),
            %backend,
            "the manifest is not supported by this backend; skipping installation"
        );
        return Ok(Installation::Nothing);
    };

    info!(manifest = manifest.file_name(), "installing dependencies");
    let program = match backend {
        RuntimeBackend::FastPath => "uv",
        RuntimeBackend::GeneralPath => "python",
    };
    let env: &ProcessEnvironment = env;
    with_retries(RetryPolicy::PACKAGES, "install-dependencies", |_| {
        let mut command = env.command(program);
        command.args(&args).current_dir(checkout);
        capture_install(logs, command)
    })
    .await?;

    Ok(Installation::Manifest(manifest))
}

/// Captures one installation attempt.
async fn capture_install(logs: &LogCapture, mut command: Command) -> Result<()> {
    logs.capture("install-dependencies", &mut command).await
}

/// Gets the arguments that install from a manifest with a backend.
///
/// Returns `None` if the backend cannot install from the manifest.
fn install_args(
    backend: RuntimeBackend,
    settings: &PythonSettings,
    manifest: DependencyManifest,
) -> Option<Vec<String>> {
    let editable = if settings.uv_extras.is_empty() {
        ".".to_string()
    } else {
        format!(".[{}]", settings.uv_extras.join(","))
    };

    let mut args: Vec<String> = match backend {
        RuntimeBackend::FastPath => vec!["pip".into(), "install".into()],
        RuntimeBackend::GeneralPath => {
            vec!["-m".into(), "pip".into(), "install".into()]
        }
    };

    match (backend, manifest) {
        (RuntimeBackend::FastPath, DependencyManifest::Project) if settings.uv_all_extras => {
            args.extend([
                "--all-extras".into(),
                "-r".into(),
                manifest.file_name().into(),
                "-e".into(),
                ".".into(),
            ]);
        }
        (_, DependencyManifest::Project | DependencyManifest::LegacyBuild) => {
            args.extend(["-e".into(), editable]);
        }
        (_, DependencyManifest::PackageList) | (RuntimeBackend::FastPath, _) => {
            args.extend(["-r".into(), manifest.file_name().into()]);
        }
        (RuntimeBackend::GeneralPath, DependencyManifest::Pinned) => return None,
    }

    Some(args)
}

/// Runs a user-supplied installation override.
///
/// An override naming an existing file is sourced, so variables it exports
/// persist into later stages. Anything else is run as a `bash` command line.
async fn run_override(
    cmd: &str,
    checkout: &Path,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
) -> Result<()> {
    let script = checkout.join(cmd.trim());
    if script.is_file() {
        info!(script = %script.display(), "sourcing installation script");
        let path = script.to_string_lossy();
        let quoted = shlex::try_quote(&path).map_err(|_| {
            BootstrapError::Precondition(format!("path `{path}` cannot be quoted for the shell"))
        })?;
        let delta = env
            .source(logs, "install-override", &format!("source {quoted}"), checkout)
            .await?;
        info!(
            changed = delta.set.len(),
            removed = delta.removed.len(),
            "merged environment changes from installation script"
        );
        return Ok(());
    }

    info!(command = cmd, "running installation command");
    let mut command = env.command("bash");
    command.arg("-c").arg(cmd).current_dir(checkout);
    logs.capture("install-override", &mut command).await
}
