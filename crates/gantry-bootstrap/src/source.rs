//! Acquisition of the job's source code.

use std::path::Path;

use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::info;

use crate::BootstrapError;
use crate::Result;
use crate::context::BootstrapContext;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::retry::RetryPolicy;
use crate::retry::with_retries;
use crate::tools::Tool;
use crate::tools::ToolInstaller;

/// Clones the job's repository into the runtime directory and checks out the
/// requested reference.
///
/// The whole clone is retried as a unit, starting from an empty directory on
/// every attempt. A reference that does not exist after a successful clone is
/// reported as [`BootstrapError::RefNotFound`] without retrying. Returns the
/// full commit hash that was checked out.
pub async fn clone_source(
    ctx: &BootstrapContext,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    tools: &ToolInstaller<'_>,
) -> Result<String> {
    env.set("GIT_TERMINAL_PROMPT", "0");

    if let Some(token) = &ctx.github_token {
        tools
            .ensure(Tool::GitHubCli, env)
            .await
            .map_err(|e| match e {
                e @ BootstrapError::ToolUnavailable { .. } => e,
                e => BootstrapError::ToolUnavailable {
                    tool: Tool::GitHubCli.program(),
                    source: Some(Box::new(e)),
                },
            })?;

        env.set("GH_TOKEN", token.expose_secret());
        let mut command = env.command("gh");
        command.args(["auth", "setup-git"]);
        logs.capture("gh-auth-setup-git", &mut command).await?;
    }

    let dir = ctx.runtime_dir.as_path();
    let url = ctx.remote_url();
    info!(repo = %ctx.repo, dir = %dir.display(), "cloning source");

    let git_env: &ProcessEnvironment = env;
    with_retries(RetryPolicy::CLONE, "clone", |attempt| {
        fetch(git_env, logs, dir, &url, ctx.branch.as_deref(), attempt)
    })
    .await
    .map_err(|e| BootstrapError::Clone {
        repo: ctx.repo.clone(),
        source: Box::new(e),
    })?;

    let commit = resolve_ref(env, logs, dir, &ctx.git_ref)
        .await?
        .ok_or_else(|| BootstrapError::RefNotFound {
            repo: ctx.repo.clone(),
            reference: ctx.git_ref.clone(),
        })?;

    let mut command = git(env, dir);
    command.args(["-c", "advice.detachedHead=false", "checkout", "-q", &commit]);
    logs.capture("git-checkout", &mut command).await?;

    let git_env: &ProcessEnvironment = env;
    with_retries(RetryPolicy::PACKAGES, "git-submodule-update", |_| {
        update_submodules(git_env, logs, dir)
    })
    .await?;

    info!(commit = %commit, "checked out source");
    Ok(commit)
}

/// Creates a `git` command running in `dir`.
fn git(env: &ProcessEnvironment, dir: &Path) -> Command {
    let mut command = env.command("git");
    command.current_dir(dir);
    command
}

/// Performs one clone attempt into an emptied directory.
async fn fetch(
    env: &ProcessEnvironment,
    logs: &LogCapture,
    dir: &Path,
    url: &str,
    branch: Option<&str>,
    attempt: u32,
) -> Result<()> {
    if attempt > 1 || dir.exists() {
        clear_dir(dir).await?;
    }

    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        BootstrapError::io(
            format!("failed to create runtime directory `{}`", dir.display()),
            e,
        )
    })?;

    let mut command = git(env, dir);
    command.args(["init", "-q"]);
    logs.capture("git-init", &mut command).await?;

    let mut command = git(env, dir);
    command.args(["remote", "add", "origin", url]);
    logs.capture("git-remote-add", &mut command).await?;

    let mut command = git(env, dir);
    command.args(["fetch", "--tags", "origin"]);
    if let Some(branch) = branch {
        command.arg(format!("+refs/heads/{branch}:refs/remotes/origin/{branch}"));
    }
    logs.capture("git-fetch", &mut command).await
}

/// Recursively initializes and updates submodules.
async fn update_submodules(
    env: &ProcessEnvironment,
    logs: &LogCapture,
    dir: &Path,
) -> Result<()> {
    let mut command = git(env, dir);
    command.args(["submodule", "update", "--init", "--recursive"]);
    logs.capture("git-submodule-update", &mut command).await
}

/// Removes the contents of a directory, keeping the directory itself.
async fn clear_dir(dir: &Path) -> Result<()> {
    let err = |e| BootstrapError::io(format!("failed to clear `{}`", dir.display()), e);

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(err(e)),
    };

    while let Some(entry) = entries.next_entry().await.map_err(err)? {
        let path = entry.path();
        if entry.file_type().await.map_err(err)?.is_dir() {
            tokio::fs::remove_dir_all(&path).await.map_err(err)?;
        } else {
            tokio::fs::remove_file(&path).await.map_err(err)?;
        }
    }

    Ok(())
}

/// Resolves a reference to a commit, trying remote-tracking branches second.
async fn resolve_ref(
    env: &ProcessEnvironment,
    logs: &LogCapture,
    dir: &Path,
    reference: &str,
) -> Result<Option<String>> {
    for candidate in [reference.to_string(), format!("origin/{reference}")] {
        let mut command = git(env, dir);
        command.args([
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("{candidate}^{{commit}}"),
        ]);
        if let Some(commit) = logs.try_output("git-rev-parse", &mut command).await? {
            return Ok(Some(commit.trim().to_string()));
        }
    }

    Ok(None)
}
