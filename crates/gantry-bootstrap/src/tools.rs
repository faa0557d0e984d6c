//! Acquisition of the external tools the bootstrap depends on.
//!
//! Each tool is looked up on `PATH` first, then in the directory it would have
//! been installed into by an earlier bootstrap. If it is still missing, the
//! tool's official installer is run; if that fails within its retry budget,
//! a release artifact is downloaded and unpacked directly instead.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;
use tracing::warn;

use crate::BootstrapError;
use crate::Result;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::retry::RetryPolicy;
use crate::retry::with_retries;

/// The GitHub API endpoint for the latest GitHub CLI release.
const GH_LATEST_RELEASE_URL: &str = "https://api.github.com/repos/cli/cli/releases/latest";

/// The user agent sent with HTTP requests.
const USER_AGENT: &str = concat!("gantry-bootstrap/", env!("CARGO_PKG_VERSION"));

/// An external tool the bootstrap can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// The GitHub CLI, used to authenticate private clones.
    GitHubCli,
    /// The `uv` package manager.
    Uv,
    /// The `conda` package manager.
    Conda,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())
    }
}

impl Tool {
    /// Gets the name of the tool's executable.
    pub fn program(&self) -> &'static str {
        match self {
            Self::GitHubCli => "gh",
            Self::Uv => "uv",
            Self::Conda => "conda",
        }
    }
}

/// A way of installing tools.
#[async_trait]
pub trait InstallMethod: fmt::Debug + Send + Sync {
    /// Gets the directory the tool's executable is installed into.
    fn bin_dir(&self, tool: Tool, home: &Path) -> PathBuf;

    /// Installs the tool under `home`.
    async fn install(
        &self,
        tool: Tool,
        env: &ProcessEnvironment,
        logs: &LogCapture,
        home: &Path,
    ) -> Result<()>;
}

/// Installs tools with their official installer scripts.
#[derive(Debug, Clone)]
pub struct OfficialInstaller {
    /// The downloader for installer scripts.
    downloader: Downloader,
}

#[async_trait]
impl InstallMethod for OfficialInstaller {
    fn bin_dir(&self, tool: Tool, home: &Path) -> PathBuf {
        match tool {
            Tool::GitHubCli | Tool::Uv => home.join(".local").join("bin"),
            Tool::Conda => home.join("miniforge3").join("bin"),
        }
    }

    async fn install(
        &self,
        tool: Tool,
        env: &ProcessEnvironment,
        logs: &LogCapture,
        home: &Path,
    ) -> Result<()> {
        let arch = std::env::consts::ARCH;
        let (url, args, vars): (String, Vec<String>, Vec<(&str, String)>) = match tool {
            Tool::GitHubCli => ("https://webi.sh/gh".to_string(), Vec::new(), Vec::new()),
            Tool::Uv => (
                "https://astral.sh/uv/install.sh".to_string(),
                Vec::new(),
                vec![
                    (
                        "UV_INSTALL_DIR",
                        self.bin_dir(tool, home).display().to_string(),
                    ),
                    ("UV_NO_MODIFY_PATH", "1".to_string()),
                ],
            ),
            Tool::Conda => (
                format!(
                    "https://github.com/conda-forge/miniforge/releases/latest/download/\
                     Miniforge3-Linux-{arch}.sh"
                ),
                vec![
                    "-b".to_string(),
                    "-u".to_string(),
                    "-p".to_string(),
                    home.join("miniforge3").display().to_string(),
                ],
                Vec::new(),
            ),
        };

        self.downloader
            .run_installer(tool, env, logs, home, &url, &args, &vars)
            .await
    }
}

/// Installs tools from release artifacts, without their official installers.
#[derive(Debug, Clone)]
pub struct ReleaseArtifacts {
    /// The downloader for release artifacts.
    downloader: Downloader,
}

#[async_trait]
impl InstallMethod for ReleaseArtifacts {
    fn bin_dir(&self, tool: Tool, home: &Path) -> PathBuf {
        match tool {
            Tool::GitHubCli | Tool::Uv => home.join(".local").join("bin"),
            Tool::Conda => home.join("miniconda3").join("bin"),
        }
    }

    async fn install(
        &self,
        tool: Tool,
        env: &ProcessEnvironment,
        logs: &LogCapture,
        home: &Path,
    ) -> Result<()> {
        let arch = std::env::consts::ARCH;
        match tool {
            Tool::GitHubCli => {
                let release: Release = self
                    .downloader
                    .client
                    .get(GH_LATEST_RELEASE_URL)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| download_error(GH_LATEST_RELEASE_URL, e))?
                    .json()
                    .await
                    .map_err(|e| download_error(GH_LATEST_RELEASE_URL, e))?;
                let version = release.tag_name.trim_start_matches('v');
                let platform = match arch {
                    "aarch64" => "arm64",
                    _ => "amd64",
                };
                let url = format!(
                    "https://github.com/cli/cli/releases/download/v{version}/\
                     gh_{version}_linux_{platform}.tar.gz"
                );
                let archive = self.downloader.download(&url).await?;
                unpack_executables(&archive, &["gh"], &self.bin_dir(tool, home))
            }
            Tool::Uv => {
                let url = format!(
                    "https://github.com/astral-sh/uv/releases/latest/download/\
                     uv-{arch}-unknown-linux-gnu.tar.gz"
                );
                let archive = self.downloader.download(&url).await?;
                unpack_executables(&archive, &["uv", "uvx"], &self.bin_dir(tool, home))
            }
            Tool::Conda => {
                let url = format!(
                    "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-{arch}.sh"
                );
                let args = [
                    "-b".to_string(),
                    "-u".to_string(),
                    "-p".to_string(),
                    home.join("miniconda3").display().to_string(),
                ];
                self.downloader
                    .run_installer(tool, env, logs, home, &url, &args, &[])
                    .await
            }
        }
    }
}

/// Installs tools on demand.
#[derive(Debug)]
pub struct ToolInstaller<'a> {
    /// Where command output is captured.
    logs: &'a LogCapture,
    /// The home directory tools are installed under.
    home: PathBuf,
    /// The retry policy for each installation method.
    policy: RetryPolicy,
    /// The method tried first.
    primary: Box<dyn InstallMethod>,
    /// The method tried when the primary method fails.
    fallback: Box<dyn InstallMethod>,
}

impl<'a> ToolInstaller<'a> {
    /// Creates a new installer using the official installers, falling back to
    /// release artifacts.
    ///
    /// Tools are installed under the `HOME` of the given environment.
    pub fn new(env: &ProcessEnvironment, logs: &'a LogCapture) -> Result<Self> {
        let downloader = Downloader::new()?;
        Self::with_methods(
            env,
            logs,
            Box::new(OfficialInstaller {
                downloader: downloader.clone(),
            }),
            Box::new(ReleaseArtifacts { downloader }),
        )
    }

    /// Creates a new installer with the given installation methods.
    pub fn with_methods(
        env: &ProcessEnvironment,
        logs: &'a LogCapture,
        primary: Box<dyn InstallMethod>,
        fallback: Box<dyn InstallMethod>,
    ) -> Result<Self> {
        let home = env
            .get_non_empty("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                BootstrapError::Precondition("unable to determine the home directory".to_string())
            })?;

        Ok(Self {
            logs,
            home,
            policy: RetryPolicy::INSTALLER,
            primary,
            fallback,
        })
    }

    /// Ensures a tool is available, installing it if necessary.
    ///
    /// On success, the directory containing the tool is on the environment's
    /// `PATH` and the path of the executable is returned.
    pub async fn ensure(&self, tool: Tool, env: &mut ProcessEnvironment) -> Result<PathBuf> {
        if let Some(path) = env.which(tool.program()) {
            return Ok(path);
        }

        let primary_dir = self.primary.bin_dir(tool, &self.home);
        let fallback_dir = self.fallback.bin_dir(tool, &self.home);
        for dir in [&primary_dir, &fallback_dir] {
            if let Some(path) = activate(tool, env, dir) {
                info!(%tool, path = %path.display(), "found previously installed tool");
                return Ok(path);
            }
        }

        info!(%tool, "installing tool");
        let base = env.clone();
        let primary = with_retries(self.policy, &format!("install-{tool}"), |_| {
            self.primary.install(tool, &base, self.logs, &self.home)
        })
        .await;

        let last = match primary {
            Ok(()) => match activate(tool, env, &primary_dir) {
                Some(path) => return Ok(path),
                None => None,
            },
            Err(e) => {
                warn!(%tool, e = %e, "primary installation failed; trying fallback");
                Some(e)
            }
        };

        let fallback = with_retries(self.policy, &format!("install-{tool}-fallback"), |_| {
            self.fallback.install(tool, &base, self.logs, &self.home)
        })
        .await;

        match fallback {
            Ok(()) => activate(tool, env, &fallback_dir).ok_or(BootstrapError::ToolUnavailable {
                tool: tool.program(),
                source: last.map(Box::new),
            }),
            Err(e) => Err(BootstrapError::ToolUnavailable {
                tool: tool.program(),
                source: Some(Box::new(e)),
            }),
        }
    }
}

/// Fetches installers and release artifacts over HTTP.
#[derive(Debug, Clone)]
struct Downloader {
    /// The HTTP client.
    client: Client,
}

impl Downloader {
    /// Creates a new downloader.
    fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                BootstrapError::Precondition(format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self { client })
    }

    /// Downloads an installer script and runs it with `bash`.
    #[allow(clippy::too_many_arguments)]
    async fn run_installer(
        &self,
        tool: Tool,
        env: &ProcessEnvironment,
        logs: &LogCapture,
        home: &Path,
        url: &str,
        args: &[String],
        vars: &[(&str, String)],
    ) -> Result<()> {
        let script = self.download(url).await?;
        let file = tempfile::NamedTempFile::new()
            .map_err(|e| BootstrapError::io("failed to create installer file", e))?;
        tokio::fs::write(file.path(), &script)
            .await
            .map_err(|e| BootstrapError::io("failed to write installer file", e))?;

        let mut command = env.command("bash");
        command
            .arg(file.path())
            .args(args)
            .env("HOME", home)
            .envs(vars.iter().map(|(k, v)| (*k, v.as_str())));
        logs.capture(&format!("install-{tool}"), &mut command).await
    }

    /// Downloads a URL into memory.
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        info!(url, "downloading");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(url, e))?;
        let bytes = response.bytes().await.map_err(|e| download_error(url, e))?;
        Ok(bytes.to_vec())
    }
}

/// The subset of a GitHub release we need.
#[derive(Debug, Deserialize)]
struct Release {
    /// The release's tag, e.g. `v2.62.0`.
    tag_name: String,
}

/// Creates a download error.
fn download_error(url: &str, source: reqwest::Error) -> BootstrapError {
    BootstrapError::Download {
        url: url.to_string(),
        source,
    }
}

/// Puts the tool's install directory on `PATH` if the tool is there.
fn activate(tool: Tool, env: &mut ProcessEnvironment, dir: &Path) -> Option<PathBuf> {
    let path = dir.join(tool.program());
    if !path.is_file() {
        return None;
    }

    env.prepend_path("PATH", dir);
    Some(path)
}

/// Extracts the named executables from a gzipped tarball into `dest`.
///
/// Entries are matched by file name regardless of the directory they are
/// in. It is an error for any of the executables to be missing.
pub fn unpack_executables(archive: &[u8], names: &[&str], dest: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dest).map_err(|e| {
        BootstrapError::io(
            format!("failed to create directory `{}`", dest.display()),
            e,
        )
    })?;

    let mut found = Vec::new();
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| BootstrapError::io("failed to read release archive", e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| BootstrapError::io("failed to read release archive", e))?;
        let path = entry
            .path()
            .map_err(|e| BootstrapError::io("invalid path in release archive", e))?
            .into_owned();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !entry.header().entry_type().is_file() || !names.contains(&name) {
            continue;
        }

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| BootstrapError::io("failed to read release archive", e))?;
        let target = dest.join(name);
        std::fs::write(&target, contents)
            .and_then(|_| std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)))
            .map_err(|e| {
                BootstrapError::io(format!("failed to write `{}`", target.display()), e)
            })?;
        found.push(name.to_string());
    }

    if let Some(missing) = names.iter().find(|n| !found.iter().any(|f| f == *n)) {
        return Err(BootstrapError::Precondition(format!(
            "release archive does not contain `{missing}`"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn unpacks_nested_executables() {
        let archive = tarball(&[
            ("uv-x86_64-unknown-linux-gnu/uv", b"#!/bin/sh\n".as_slice()),
            ("uv-x86_64-unknown-linux-gnu/uvx", b"#!/bin/sh\n".as_slice()),
            ("uv-x86_64-unknown-linux-gnu/LICENSE", b"MIT".as_slice()),
        ]);
        let dest = tempdir().unwrap();

        unpack_executables(&archive, &["uv", "uvx"], dest.path()).unwrap();

        let uv = dest.path().join("uv");
        assert_eq!(std::fs::read(&uv).unwrap(), b"#!/bin/sh\n");
        assert_eq!(uv.metadata().unwrap().permissions().mode() & 0o777, 0o755);
        assert!(!dest.path().join("LICENSE").exists());
    }

    #[test]
    fn missing_executables_are_reported() {
        let archive = tarball(&[("gh_2.62.0_linux_amd64/LICENSE", b"MIT".as_slice())]);
        let dest = tempdir().unwrap();

        let err = unpack_executables(&archive, &["gh"], dest.path()).unwrap_err();
        assert_eq!(err.to_string(), "release archive does not contain `gh`");
    }

    #[tokio::test]
    async fn tools_on_path_are_used_as_is() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let uv = bin.join("uv");
        std::fs::write(&uv, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&uv, std::fs::Permissions::from_mode(0o755)).unwrap();

        let logs = LogCapture::new(dir.path());
        let mut env = ProcessEnvironment::from_vars([
            ("PATH", bin.display().to_string()),
            ("HOME", dir.path().display().to_string()),
        ]);
        let installer = ToolInstaller::new(&env, &logs).unwrap();

        assert_eq!(installer.ensure(Tool::Uv, &mut env).await.unwrap(), uv);
        assert_eq!(env.get("PATH"), Some(bin.display().to_string().as_str()));
    }

    #[tokio::test]
    async fn previously_installed_tools_are_activated() {
        let home = tempdir().unwrap();
        let bin = home.path().join("miniforge3").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let conda = bin.join("conda");
        std::fs::write(&conda, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&conda, std::fs::Permissions::from_mode(0o755)).unwrap();

        let logs = LogCapture::new(home.path());
        let mut env = ProcessEnvironment::from_vars([
            ("PATH", "/nonexistent".to_string()),
            ("HOME", home.path().display().to_string()),
        ]);
        let installer = ToolInstaller::new(&env, &logs).unwrap();

        assert_eq!(installer.ensure(Tool::Conda, &mut env).await.unwrap(), conda);
        assert_eq!(
            env.get("PATH"),
            Some(format!("{}:/nonexistent", bin.display()).as_str())
        );
    }

    /// An installation method that either installs a stub executable or
    /// fails like a broken installer script.
    #[derive(Debug)]
    struct Scripted {
        /// The directory under the home directory executables go into.
        dir: &'static str,
        /// Whether installation succeeds.
        succeeds: bool,
        /// The number of installation attempts.
        attempts: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(dir: &'static str, succeeds: bool) -> (Box<dyn InstallMethod>, Arc<AtomicU32>) {
            let attempts = Arc::new(AtomicU32::new(0));
            let method = Box::new(Self {
                dir,
                succeeds,
                attempts: attempts.clone(),
            });
            (method, attempts)
        }
    }

    #[async_trait]
    impl InstallMethod for Scripted {
        fn bin_dir(&self, _: Tool, home: &Path) -> PathBuf {
            home.join(self.dir)
        }

        async fn install(
            &self,
            tool: Tool,
            _: &ProcessEnvironment,
            logs: &LogCapture,
            home: &Path,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.succeeds {
                return Err(BootstrapError::CommandFailed {
                    label: format!("install-{tool}"),
                    status: ExitStatus::from_raw(1 << 8),
                    log: logs.dir().join("001-install.log"),
                });
            }

            let dir = self.bin_dir(tool, home);
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(tool.program());
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            Ok(())
        }
    }

    fn bare_env(home: &Path) -> ProcessEnvironment {
        ProcessEnvironment::from_vars([
            ("PATH", "/nonexistent".to_string()),
            ("HOME", home.display().to_string()),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_when_primary_fails() {
        let home = tempdir().unwrap();
        let logs = LogCapture::new(home.path());
        let mut env = bare_env(home.path());
        let (primary, primary_attempts) = Scripted::new("primary", false);
        let (fallback, fallback_attempts) = Scripted::new("fallback", true);
        let installer = ToolInstaller::with_methods(&env, &logs, primary, fallback).unwrap();

        let path = installer.ensure(Tool::GitHubCli, &mut env).await.unwrap();
        assert_eq!(path, home.path().join("fallback").join("gh"));
        assert_eq!(
            primary_attempts.load(Ordering::SeqCst),
            RetryPolicy::INSTALLER.max_attempts
        );
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            env.get("PATH"),
            Some(format!("{}:/nonexistent", home.path().join("fallback").display()).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn primary_installation_is_preferred() {
        let home = tempdir().unwrap();
        let logs = LogCapture::new(home.path());
        let mut env = bare_env(home.path());
        let (primary, _) = Scripted::new("primary", true);
        let (fallback, fallback_attempts) = Scripted::new("fallback", true);
        let installer = ToolInstaller::with_methods(&env, &logs, primary, fallback).unwrap();

        let path = installer.ensure(Tool::Uv, &mut env).await.unwrap();
        assert_eq!(path, home.path().join("primary").join("uv"));
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tools_are_unavailable_when_every_method_fails() {
        let home = tempdir().unwrap();
        let logs = LogCapture::new(home.path());
        let mut env = bare_env(home.path());
        let (primary, _) = Scripted::new("primary", false);
        let (fallback, fallback_attempts) = Scripted::new("fallback", false);
        let installer = ToolInstaller::with_methods(&env, &logs, primary, fallback).unwrap();

        let err = installer.ensure(Tool::Conda, &mut env).await.unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ToolUnavailable { tool: "conda", .. }
        ));
        assert_eq!(
            fallback_attempts.load(Ordering::SeqCst),
            RetryPolicy::INSTALLER.max_attempts
        );
        assert_eq!(env.get("PATH"), Some("/nonexistent"));
    }
}
