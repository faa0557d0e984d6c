//! Resolution of the source revision a job runs.
//!
//! A job clones its source from GitHub at an exact commit, so the commit must
//! already be reachable from a branch on the remote when the job is
//! submitted.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use git2::BranchType;
use git2::Oid;
use git2::Repository;
use git2::StatusOptions;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

/// The name of the remote used when the current branch tracks nothing.
const DEFAULT_REMOTE: &str = "origin";

/// How long to wait for GitHub when checking if a repository is public.
const PUBLIC_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents an error resolving the source revision.
#[derive(Debug, Error)]
pub enum GitError {
    /// The directory is not a git repository.
    #[error(
        "`{path}` is not the root of a git repository; use `--remote` to launch from a remote \
         repository",
        path = .path.display()
    )]
    NotARepository {
        /// The directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: git2::Error,
    },
    /// The remote is not a GitHub repository.
    #[error("remote `{0}` must point to a GitHub repository")]
    InvalidRemote(String),
    /// The current branch does not track a remote branch.
    #[error(
        "local branch `{branch}` does not track a remote branch; push it with `git push \
         --set-upstream {remote} {branch}`"
    )]
    RemoteBranchNotFound {
        /// The local branch.
        branch: String,
        /// The remote the branch should be pushed to.
        remote: String,
    },
    /// The commit has not been pushed.
    #[error("commit `{commit}` does not exist on {location}; push your changes and try again")]
    UnpushedChanges {
        /// The commit.
        commit: String,
        /// The remote branch, or the remote as a whole.
        location: String,
    },
    /// A remote repository was given without a revision.
    #[error("`--ref` is required when launching from a remote repository")]
    MissingRef,
    /// A git operation failed.
    #[error(transparent)]
    Git(#[from] git2::Error),
}

/// The source revision a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepoState {
    /// The repository, as `owner/name`.
    pub repo: String,
    /// The commit to check out.
    pub git_ref: String,
    /// The remote branch containing the commit, if known.
    pub branch: Option<String>,
    /// Whether the local checkout has uncommitted changes.
    pub is_dirty: bool,
    /// The root of the local checkout, if the revision came from one.
    root: Option<PathBuf>,
}

impl GitRepoState {
    /// Resolves the revision from the repository rooted at `dir`.
    ///
    /// `git_ref` overrides the checked out commit, and `branch` overrides the
    /// remote branch. Without a `branch`, the current branch must track a
    /// remote branch containing the commit.
    pub fn local(
        dir: &Path,
        git_ref: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Self, GitError> {
        let repo = Repository::open(dir).map_err(|source| GitError::NotARepository {
            path: dir.to_path_buf(),
            source,
        })?;

        let commit = match git_ref {
            Some(r) => repo.revparse_single(r)?.peel_to_commit()?.id(),
            None => repo.head()?.peel_to_commit()?.id(),
        };

        let (remote, branch) = match branch {
            Some(branch) => (DEFAULT_REMOTE.to_string(), Some(branch.to_string())),
            None => tracked_branch(&repo, commit)?,
        };

        let url = repo
            .find_remote(&remote)?
            .url()
            .map(str::to_string)
            .ok_or_else(|| GitError::InvalidRemote(remote.clone()))?;

        let state = Self {
            repo: parse_github_url(&url)?,
            git_ref: commit.to_string(),
            branch,
            is_dirty: is_dirty(&repo)?,
            root: Some(dir.to_path_buf()),
        };
        debug!(repo = %state.repo, git_ref = %state.git_ref, "resolved source revision");
        Ok(state)
    }

    /// Uses a revision of a remote repository without a local checkout.
    pub fn remote(
        url: &str,
        git_ref: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Self, GitError> {
        Ok(Self {
            repo: parse_github_url(url)?,
            git_ref: git_ref.ok_or(GitError::MissingRef)?.to_string(),
            branch: branch.map(str::to_string),
            is_dirty: false,
            root: None,
        })
    }

    /// Gets the URL the repository is cloned from.
    pub fn repo_url(&self) -> String {
        format!("https://github.com/{repo}", repo = self.repo)
    }

    /// Gets the URL of the commit.
    pub fn ref_url(&self) -> String {
        format!("{url}/commit/{r}", url = self.repo_url(), r = self.git_ref)
    }

    /// Determines if a file exists at `path` in the commit.
    ///
    /// Files of remote repositories are never known to exist.
    pub fn is_in_tree(&self, path: &str) -> Result<bool, GitError> {
        let Some(root) = &self.root else {
            return Ok(false);
        };

        let repo = Repository::open(root)?;
        let tree = repo
            .find_commit(Oid::from_str(&self.git_ref)?)?
            .tree()?;
        Ok(tree.get_path(Path::new(path)).is_ok())
    }

    /// Determines if the repository can be cloned without credentials.
    pub async fn is_public(&self) -> anyhow::Result<bool> {
        let client = reqwest::Client::builder()
            .timeout(PUBLIC_CHECK_TIMEOUT)
            .build()?;
        let response = client.get(self.repo_url()).send().await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => {
                response.error_for_status()?;
                Ok(false)
            }
        }
    }
}

/// Finds the remote and branch that the current branch tracks, checking that
/// `commit` has been pushed.
fn tracked_branch(repo: &Repository, commit: Oid) -> Result<(String, Option<String>), GitError> {
    let head = repo.head()?;
    if !head.is_branch() {
        warn!(
            "the repository is in a detached HEAD state, so the job will clone the entire \
             repository; consider launching from a branch"
        );

        for branch in repo.branches(Some(BranchType::Remote))? {
            let (branch, _) = branch?;
            if let Some(tip) = branch.get().target()
                && contains(repo, tip, commit)?
            {
                return Ok((DEFAULT_REMOTE.to_string(), None));
            }
        }

        return Err(GitError::UnpushedChanges {
            commit: commit.to_string(),
            location: "the remote".to_string(),
        });
    }

    let local = git2::Branch::wrap(head);
    let local_name = local.name()?.unwrap_or_default().to_string();
    let upstream = local
        .upstream()
        .map_err(|_| GitError::RemoteBranchNotFound {
            branch: local_name.clone(),
            remote: DEFAULT_REMOTE.to_string(),
        })?;

    let upstream_name = upstream.name()?.unwrap_or_default().to_string();
    let refname = format!("refs/heads/{local_name}");
    let remote = repo
        .branch_upstream_remote(&refname)?
        .as_str()
        .unwrap_or(DEFAULT_REMOTE)
        .to_string();

    let tip = upstream.get().peel_to_commit()?.id();
    if !contains(repo, tip, commit)? {
        return Err(GitError::UnpushedChanges {
            commit: commit.to_string(),
            location: format!("remote branch `{upstream_name}`"),
        });
    }

    let branch = upstream_name
        .strip_prefix(&format!("{remote}/"))
        .unwrap_or(&upstream_name)
        .to_string();
    Ok((remote, Some(branch)))
}

/// Determines if `commit` is `tip` or one of its ancestors.
fn contains(repo: &Repository, tip: Oid, commit: Oid) -> Result<bool, git2::Error> {
    Ok(tip == commit || repo.graph_descendant_of(tip, commit)?)
}

/// Determines if tracked files have uncommitted changes.
fn is_dirty(repo: &Repository) -> Result<bool, git2::Error> {
    let mut options = StatusOptions::new();
    options.include_untracked(false).include_ignored(false);
    Ok(!repo.statuses(Some(&mut options))?.is_empty())
}

/// Parses a GitHub remote URL into an `owner/name` pair.
///
/// HTTPS and SSH URLs are accepted, as is a bare `owner/name`.
pub fn parse_github_url(url: &str) -> Result<String, GitError> {
    let invalid = || GitError::InvalidRemote(url.to_string());
    let is_name = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };

    let path = match url.split_once("github.com") {
        Some((_, path)) => path.trim_matches(|c| c == '/' || c == ':'),
        None if !url.contains(':') => url,
        None => return Err(invalid()),
    };
    let path = path.strip_suffix(".git").unwrap_or(path);

    match path.split_once('/') {
        Some((owner, name)) if is_name(owner) && is_name(name) => Ok(format!("{owner}/{name}")),
        _ => Err(invalid()),
    }
}
