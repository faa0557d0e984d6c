//! The fast-path backend, built on `uv`.

use std::path::Path;
use std::path::PathBuf;

use tracing::info;

use super::Construction;
use super::EnvironmentKind;
use super::FROZEN_REQUIREMENTS;
use super::write_artifact;
use crate::Result;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::retry::RetryPolicy;
use crate::retry::with_retries;
use crate::tools::Tool;
use crate::tools::ToolInstaller;

/// The name of the virtual environment created inside the checkout.
pub const VENV_DIR_NAME: &str = ".venv";

/// Constructs and activates a `uv` environment.
pub(super) async fn construct(
    construction: &Construction,
    checkout: &Path,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    tools: &ToolInstaller<'_>,
) -> Result<(EnvironmentKind, Option<PathBuf>)> {
    tools.ensure(Tool::Uv, env).await?;

    let version = match construction {
        Construction::UseSystem => {
            info!("using the system Python interpreter");
            env.set("UV_SYSTEM_PYTHON", "1");
            return Ok((EnvironmentKind::System, None));
        }
        Construction::UseExisting(venv) => {
            let prefix = PathBuf::from(venv);
            info!(venv = %prefix.display(), "using existing virtual environment");
            activate(env, &prefix);
            return Ok((EnvironmentKind::Reused, Some(prefix)));
        }
        Construction::CreateWithVersion(version) => Some(version.as_str()),
        Construction::CreateFromManifest(_) | Construction::CreateDefault => None,
    };

    let prefix = checkout.join(VENV_DIR_NAME);
    info!(venv = %prefix.display(), python = version, "creating virtual environment");
    let base: &ProcessEnvironment = env;
    with_retries(RetryPolicy::PACKAGES, "uv-venv", |_| {
        let mut command = base.command("uv");
        command.args(["venv", "--allow-existing"]);
        if let Some(version) = version {
            command.args(["--python", version]);
        }
        command.arg(&prefix).current_dir(checkout);
        async move { logs.capture("uv-venv", &mut command).await }
    })
    .await?;

    activate(env, &prefix);
    Ok((EnvironmentKind::CreatedEmpty, Some(prefix)))
}

/// Activates a virtual environment.
fn activate(env: &mut ProcessEnvironment, prefix: &Path) {
    env.set("VIRTUAL_ENV", prefix.display().to_string());
    env.prepend_path("PATH", &prefix.join("bin"));
    env.remove("PYTHONHOME");
}

/// Writes the installed packages to the results directory.
pub(super) async fn freeze(
    gantry_dir: &Path,
    checkout: &Path,
    env: &ProcessEnvironment,
    logs: &LogCapture,
) -> Result<()> {
    let mut command = env.command("uv");
    command.args(["pip", "freeze"]).current_dir(checkout);
    let frozen = logs.output("uv-pip-freeze", &mut command).await?;
    write_artifact(gantry_dir, FROZEN_REQUIREMENTS, &frozen).await
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    /// A stand-in for `uv` that records its arguments and creates
    /// environments.
    const STUB_UV: &str = r#"#!/bin/sh
echo "$@" >> "$STUB_LOG"
if [ "$1" = "venv" ]; then
    for last; do :; done
    mkdir -p "$last/bin"
fi
if [ "$1" = "pip" ] && [ "$2" = "freeze" ]; then
    echo "numpy==2.0.0"
fi
"#;

    #[tokio::test]
    async fn creates_and_activates_virtual_environment() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        std::fs::write(bin.join("uv"), STUB_UV).unwrap();
        std::fs::set_permissions(bin.join("uv"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        let checkout = dir.path().join("checkout");
        std::fs::create_dir(&checkout).unwrap();
        let results = dir.path().join("results");
        let logs = LogCapture::new(&results);
        logs.create_dir().await.unwrap();
        let stub_log = dir.path().join("uv.log");

        let mut env = ProcessEnvironment::from_vars([
            ("PATH", format!("{}:/usr/bin:/bin", bin.display())),
            ("HOME", dir.path().display().to_string()),
            ("STUB_LOG", stub_log.display().to_string()),
            ("PYTHONHOME", "/usr".to_string()),
        ]);
        let tools = ToolInstaller::new(&env, &logs).unwrap();

        let (kind, prefix) = construct(
            &Construction::CreateWithVersion("3.12".into()),
            &checkout,
            &mut env,
            &logs,
            &tools,
        )
        .await
        .unwrap();

        let venv = checkout.join(".venv");
        assert_eq!(kind, EnvironmentKind::CreatedEmpty);
        assert_eq!(prefix.as_deref(), Some(venv.as_path()));
        assert_eq!(env.get("VIRTUAL_ENV"), Some(venv.display().to_string().as_str()));
        assert!(
            env.get("PATH")
                .unwrap()
                .starts_with(&venv.join("bin").display().to_string())
        );
        assert_eq!(env.get("PYTHONHOME"), None);
        assert_eq!(
            std::fs::read_to_string(&stub_log).unwrap(),
            format!("venv --allow-existing --python 3.12 {}\n", venv.display())
        );

        let gantry_dir = results.join(".gantry");
        freeze(&gantry_dir, &checkout, &env, &logs).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(gantry_dir.join("requirements.txt")).unwrap(),
            "numpy==2.0.0\n"
        );
    }
}
