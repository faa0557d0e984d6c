//! The general-path backend, built on `conda`.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::info;
use tracing::warn;

use super::Construction;
use super::EXPORTED_ENVIRONMENT;
use super::EnvironmentKind;
use super::FROZEN_REQUIREMENTS;
use super::write_artifact;
use crate::BootstrapError;
use crate::Result;
use crate::context::DEFAULT_CONDA_ENV;
use crate::context::MismatchPolicy;
use crate::context::PythonSettings;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::retry::RetryPolicy;
use crate::retry::with_retries;
use crate::tools::Tool;
use crate::tools::ToolInstaller;

/// The environment files searched for in the checkout, in order.
const ENVIRONMENT_FILES: &[&str] = &["environment.yml", "environment.yaml"];

/// Finds the environment file to use, if any.
///
/// A configured file must exist; otherwise the checkout is searched.
pub fn environment_file(settings: &PythonSettings, checkout: &Path) -> Result<Option<PathBuf>> {
    if let Some(file) = &settings.conda_file {
        let path = checkout.join(file);
        if !path.is_file() {
            return Err(BootstrapError::Precondition(format!(
                "conda environment file `{file}` given by `GANTRY_CONDA_FILE` does not exist",
                file = file.display()
            )));
        }

        return Ok(Some(path));
    }

    Ok(ENVIRONMENT_FILES
        .iter()
        .map(|name| checkout.join(name))
        .find(|path| path.is_file()))
}

/// A `conda` environment, identified by name or by prefix path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// A named environment.
    Name(String),
    /// An environment at a prefix path.
    Prefix(PathBuf),
}

impl Target {
    /// Parses a target; anything containing a `/` is a path.
    fn new(s: &str) -> Self {
        if s.contains('/') {
            Self::Prefix(PathBuf::from(s))
        } else {
            Self::Name(s.to_string())
        }
    }

    /// Gets the arguments selecting this environment.
    fn args(&self) -> [String; 2] {
        match self {
            Self::Name(name) => ["-n".to_string(), name.clone()],
            Self::Prefix(path) => ["-p".to_string(), path.display().to_string()],
        }
    }

    /// Gets the value passed to `conda activate`.
    fn activation_arg(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Prefix(path) => path.display().to_string(),
        }
    }

    /// Determines if the environment at `prefix` is this target.
    ///
    /// The first environment listed by `conda` is the base environment.
    fn matches(&self, prefix: &Path, is_base: bool) -> bool {
        match self {
            Self::Name(name) if name == "base" => is_base,
            Self::Name(name) => !is_base && prefix.file_name().is_some_and(|n| n == name.as_str()),
            Self::Prefix(path) => prefix == path,
        }
    }
}

/// The output of `conda env list --json`.
#[derive(Debug, Deserialize)]
struct EnvList {
    /// The prefixes of every known environment.
    envs: Vec<PathBuf>,
}

/// Constructs and activates a `conda` environment.
pub(super) async fn construct(
    construction: &Construction,
    settings: &PythonSettings,
    checkout: &Path,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    tools: &ToolInstaller<'_>,
) -> Result<(EnvironmentKind, Option<PathBuf>)> {
    if *construction == Construction::UseSystem {
        info!("using the system Python interpreter");
        return Ok((EnvironmentKind::System, None));
    }

    tools.ensure(Tool::Conda, env).await?;

    let target = Target::new(settings.conda_env.as_deref().unwrap_or(DEFAULT_CONDA_ENV));
    let manifest = environment_file(settings, checkout)?;

    let kind = if is_active(env, &target) {
        info!(env = %target.activation_arg(), "conda environment is already active");
        update(env, logs, checkout, &target, manifest.as_deref()).await?;
        EnvironmentKind::Reused
    } else if exists(env, logs, &target).await? {
        info!(env = %target.activation_arg(), "reusing existing conda environment");
        activate(env, logs, checkout, &target).await?;
        update(env, logs, checkout, &target, manifest.as_deref()).await?;
        EnvironmentKind::Reused
    } else {
        let kind = create(construction, env, logs, checkout, &target, manifest.as_deref()).await?;
        activate(env, logs, checkout, &target).await?;
        kind
    };

    let base: &ProcessEnvironment = env;
    with_retries(RetryPolicy::PACKAGES, "conda-install-pip", |_| {
        let mut command = base.command("conda");
        command.args(["install", "-y", "pip"]).current_dir(checkout);
        async move { logs.capture("conda-install-pip", &mut command).await }
    })
    .await?;

    check_installer_prefix(env, settings.prefix_mismatch)?;

    let prefix = env.get_non_empty("CONDA_PREFIX").map(PathBuf::from);
    Ok((kind, prefix))
}

/// Determines if the target is the currently active environment.
fn is_active(env: &ProcessEnvironment, target: &Target) -> bool {
    match target {
        Target::Name(name) => env.get("CONDA_DEFAULT_ENV") == Some(name.as_str()),
        Target::Prefix(path) => env
            .get_non_empty("CONDA_PREFIX")
            .is_some_and(|p| Path::new(p) == path),
    }
}

/// Determines if the target environment exists.
async fn exists(env: &ProcessEnvironment, logs: &LogCapture, target: &Target) -> Result<bool> {
    let mut command = env.command("conda");
    command.args(["env", "list", "--json"]);
    let output = logs.output("conda-env-list", &mut command).await?;
    let list: EnvList = serde_json::from_str(&output).map_err(|e| {
        BootstrapError::Precondition(format!("failed to parse `conda env list` output: {e}"))
    })?;

    Ok(list
        .envs
        .iter()
        .enumerate()
        .any(|(i, prefix)| target.matches(prefix, i == 0)))
}

/// Creates the target environment.
async fn create(
    construction: &Construction,
    env: &ProcessEnvironment,
    logs: &LogCapture,
    checkout: &Path,
    target: &Target,
    manifest: Option<&Path>,
) -> Result<EnvironmentKind> {
    let (args, kind): (Vec<String>, _) = match (construction, manifest) {
        (_, Some(manifest)) => (
            vec![
                "env".into(),
                "create".into(),
                "-f".into(),
                manifest.display().to_string(),
            ],
            EnvironmentKind::CreatedFromManifest,
        ),
        (Construction::CreateWithVersion(version), None) => (
            vec!["create".into(), "-y".into(), format!("python={version}")],
            EnvironmentKind::CreatedEmpty,
        ),
        (_, None) => (
            vec!["create".into(), "-y".into(), "python".into()],
            EnvironmentKind::CreatedEmpty,
        ),
    };

    info!(env = %target.activation_arg(), "creating conda environment");
    with_retries(RetryPolicy::PACKAGES, "conda-create", |_| {
        let mut command = env.command("conda");
        command
            .args(&args)
            .args(target.args())
            .current_dir(checkout);
        async move { logs.capture("conda-create", &mut command).await }
    })
    .await?;

    Ok(kind)
}

/// Updates the target environment from an environment file, if given.
async fn update(
    env: &ProcessEnvironment,
    logs: &LogCapture,
    checkout: &Path,
    target: &Target,
    manifest: Option<&Path>,
) -> Result<()> {
    let Some(manifest) = manifest else {
        return Ok(());
    };

    info!(file = %manifest.display(), "updating conda environment");
    with_retries(RetryPolicy::PACKAGES, "conda-env-update", |_| {
        let mut command = env.command("conda");
        command
            .args(["env", "update"])
            .args(target.args())
            .arg("-f")
            .arg(manifest)
            .current_dir(checkout);
        async move { logs.capture("conda-env-update", &mut command).await }
    })
    .await
}

/// Activates the target environment, merging the activation's variables.
async fn activate(
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    checkout: &Path,
    target: &Target,
) -> Result<()> {
    let arg = target.activation_arg();
    let quoted = shlex::try_quote(&arg).map_err(|_| {
        BootstrapError::Precondition(format!("environment `{arg}` cannot be quoted for the shell"))
    })?;
    env.source(
        logs,
        "conda-activate",
        &format!("eval \"$(conda shell.bash hook)\"\nconda activate {quoted}"),
        checkout,
    )
    .await?;
    Ok(())
}

/// Checks that `pip` belongs to the active interpreter.
fn check_installer_prefix(env: &ProcessEnvironment, policy: MismatchPolicy) -> Result<()> {
    let python = env.which("python");
    let pip = env.which("pip");
    let (Some(python), Some(pip)) = (python, pip) else {
        return Ok(());
    };

    if python.parent() == pip.parent() {
        return Ok(());
    }

    let message = format!(
        "`pip` (`{pip}`) does not belong to the active interpreter (`{python}`)",
        pip = pip.display(),
        python = python.display()
    );
    match policy {
        MismatchPolicy::Warn => {
            warn!("{message}");
            Ok(())
        }
        MismatchPolicy::Error => Err(BootstrapError::Precondition(message)),
    }
}

/// Writes the installed packages and the environment to the results
/// directory.
pub(super) async fn freeze(
    gantry_dir: &Path,
    checkout: &Path,
    env: &ProcessEnvironment,
    logs: &LogCapture,
) -> Result<()> {
    let mut command = env.command("python");
    command.args(["-m", "pip", "freeze"]).current_dir(checkout);
    let frozen = logs.output("pip-freeze", &mut command).await?;
    write_artifact(gantry_dir, FROZEN_REQUIREMENTS, &frozen).await?;

    if env.which("conda").is_some() {
        let mut command = env.command("conda");
        command.args(["env", "export"]).current_dir(checkout);
        let exported = logs.output("conda-env-export", &mut command).await?;
        write_artifact(gantry_dir, EXPORTED_ENVIRONMENT, &exported).await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tempfile::tempdir;

    use super::*;

    /// A stand-in for `conda` that records its arguments.
    ///
    /// `STUB_ENVS` is the JSON list of known environments; `STUB_PREFIX` is
    /// the prefix activated by `conda activate`.
    const STUB_CONDA: &str = r#"#!/bin/sh
echo "$@" >> "$STUB_LOG"
case "$1" in
    env)
        if [ "$2" = "list" ]; then
            echo "{\"envs\": $STUB_ENVS}"
        fi
        ;;
    shell.bash)
        cat <<EOF
conda() {
    if [ "\$1" = "activate" ]; then
        export CONDA_PREFIX="$STUB_PREFIX"
        export CONDA_DEFAULT_ENV="\$2"
        export PATH="$STUB_PREFIX/bin:\$PATH"
    fi
}
EOF
        ;;
esac
"#;

    struct Fixture {
        dir: TempDir,
        checkout: PathBuf,
        logs: LogCapture,
        env: ProcessEnvironment,
    }

    impl Fixture {
        async fn new(envs: &str) -> Self {
            let dir = tempdir().unwrap();
            let bin = dir.path().join("bin");
            std::fs::create_dir(&bin).unwrap();
            std::fs::write(bin.join("conda"), STUB_CONDA).unwrap();
            std::fs::set_permissions(bin.join("conda"), std::fs::Permissions::from_mode(0o755))
                .unwrap();
            let prefix = dir.path().join("envs").join("gantry");
            std::fs::create_dir_all(prefix.join("bin")).unwrap();

            let checkout = dir.path().join("checkout");
            std::fs::create_dir(&checkout).unwrap();
            let logs = LogCapture::new(&dir.path().join("results"));
            logs.create_dir().await.unwrap();

            let env = ProcessEnvironment::from_vars([
                ("PATH", format!("{}:/usr/bin:/bin", bin.display())),
                ("HOME", dir.path().display().to_string()),
                ("STUB_LOG", dir.path().join("conda.log").display().to_string()),
                ("STUB_ENVS", envs.to_string()),
                ("STUB_PREFIX", prefix.display().to_string()),
            ]);

            Self {
                dir,
                checkout,
                logs,
                env,
            }
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("conda.log"))
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }

        async fn construct(&mut self, settings: &PythonSettings) -> EnvironmentKind {
            let construction = Construction::select(
                super::super::RuntimeBackend::GeneralPath,
                settings,
                &self.checkout,
            )
            .unwrap();
            let tools = ToolInstaller::new(&self.env, &self.logs).unwrap();
            construct(
                &construction,
                settings,
                &self.checkout,
                &mut self.env,
                &self.logs,
                &tools,
            )
            .await
            .unwrap()
            .0
        }
    }

    fn conda_settings() -> PythonSettings {
        PythonSettings {
            manager: crate::context::PythonManager::Conda,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_missing_environment_from_file() {
        let mut fixture = Fixture::new(r#"["/opt/conda"]"#).await;
        std::fs::write(fixture.checkout.join("environment.yml"), "name: x\n").unwrap();

        let kind = fixture.construct(&conda_settings()).await;

        assert_eq!(kind, EnvironmentKind::CreatedFromManifest);
        let file = fixture.checkout.join("environment.yml");
        assert_eq!(
            fixture.calls(),
            [
                "env list --json".to_string(),
                format!("env create -f {} -n gantry", file.display()),
                "shell.bash hook".to_string(),
                "install -y pip".to_string(),
            ]
        );
        assert_eq!(fixture.env.get("CONDA_DEFAULT_ENV"), Some("gantry"));
    }

    #[tokio::test]
    async fn existing_environment_is_reused_and_updated() {
        let mut fixture = Fixture::new(r#"["/opt/conda", "/opt/conda/envs/gantry"]"#).await;
        std::fs::write(fixture.checkout.join("environment.yml"), "name: x\n").unwrap();

        let kind = fixture.construct(&conda_settings()).await;

        assert_eq!(kind, EnvironmentKind::Reused);
        let calls = fixture.calls();
        assert!(!calls.iter().any(|c| c.contains("create")), "{calls:?}");
        assert!(calls.iter().any(|c| c.starts_with("env update -n gantry -f")));
    }

    #[tokio::test]
    async fn active_environment_is_not_recreated() {
        let mut fixture = Fixture::new(r#"["/opt/conda"]"#).await;
        fixture.env.set("CONDA_DEFAULT_ENV", "gantry");

        let kind = fixture.construct(&conda_settings()).await;

        assert_eq!(kind, EnvironmentKind::Reused);
        assert_eq!(fixture.calls(), ["install -y pip"]);
    }

    #[tokio::test]
    async fn default_environment_is_created_with_version() {
        let mut fixture = Fixture::new(r#"["/opt/conda"]"#).await;
        let settings = PythonSettings {
            version: Some("3.10".into()),
            ..conda_settings()
        };

        let kind = fixture.construct(&settings).await;

        assert_eq!(kind, EnvironmentKind::CreatedEmpty);
        assert!(
            fixture
                .calls()
                .contains(&"create -y python=3.10 -n gantry".to_string())
        );
    }

    #[test]
    fn installer_prefix_mismatch_policy() {
        let dir = tempdir().unwrap();
        for name in ["env/bin", "other/bin"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        for path in ["env/bin/python", "other/bin/pip"] {
            let path = dir.path().join(path);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let env = ProcessEnvironment::from_vars([(
            "PATH",
            format!(
                "{}:{}",
                dir.path().join("env/bin").display(),
                dir.path().join("other/bin").display()
            ),
        )]);

        check_installer_prefix(&env, MismatchPolicy::Warn).unwrap();
        let err = check_installer_prefix(&env, MismatchPolicy::Error).unwrap_err();
        assert!(err.to_string().contains("does not belong to the active interpreter"));
    }

    #[test]
    fn targets() {
        assert_eq!(Target::new("train"), Target::Name("train".into()));
        assert_eq!(
            Target::new("/opt/envs/train"),
            Target::Prefix("/opt/envs/train".into())
        );
        let prefix = Path::new("/opt/conda/envs/train");
        assert!(Target::new("train").matches(prefix, false));
        assert!(!Target::new("base").matches(prefix, false));
        assert!(Target::new("base").matches(Path::new("/opt/conda"), true));
    }
}
