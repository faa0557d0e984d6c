//! The process environment threaded through the bootstrap stages.
//!
//! Stages never mutate the environment of the bootstrap process itself.
//! Instead, each stage receives a [`ProcessEnvironment`] and updates it; every
//! command the stage spawns is given exactly that environment. Shell scripts
//! that export variables are run through [`ProcessEnvironment::source`], which
//! captures the variables the script changed as an [`EnvDelta`] and merges it
//! back in.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

use tokio::process::Command;

use crate::BootstrapError;
use crate::Result;
use crate::logs::LogCapture;

/// Variables maintained by the shell itself that are never part of a delta.
const SHELL_VARIABLES: &[&str] = &["_", "SHLVL", "PWD", "OLDPWD"];

/// An explicit set of environment variables for spawned processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnvironment {
    /// The variables, ordered by name.
    vars: BTreeMap<String, String>,
}

/// The changes a script made to its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDelta {
    /// Variables that were added or changed.
    pub set: BTreeMap<String, String>,
    /// Variables that were removed.
    pub removed: BTreeSet<String>,
}

impl EnvDelta {
    /// Determines if the delta contains no changes.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }
}

impl ProcessEnvironment {
    /// Captures the environment of the current process.
    ///
    /// Variables whose names or values are not valid UTF-8 are skipped.
    pub fn from_current() -> Self {
        Self::from_vars(std::env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }

    /// Creates an environment from the given variables.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Gets the value of a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Gets the value of a variable if it is set and non-empty.
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// Sets a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Removes a variable.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    /// Iterates over the variables.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Prepends a directory to a colon-separated search path variable.
    ///
    /// Any existing occurrence of the directory is moved to the front.
    pub fn prepend_path(&mut self, name: &str, dir: &Path) {
        let dir = dir.to_string_lossy();
        let mut entries = vec![dir.to_string()];
        if let Some(existing) = self.get(name) {
            entries.extend(
                existing
                    .split(':')
                    .filter(|e| !e.is_empty() && *e != dir)
                    .map(str::to_string),
            );
        }
        self.set(name, entries.join(":"));
    }

    /// Appends a directory to a colon-separated search path variable.
    ///
    /// An inherited value is always kept; the directory is not added twice.
    pub fn append_path(&mut self, name: &str, dir: &Path) {
        let dir = dir.to_string_lossy();
        match self.get_non_empty(name) {
            Some(existing) if existing.split(':').any(|e| e == dir) => {}
            Some(existing) => {
                let value = format!("{existing}:{dir}");
                self.set(name, value);
            }
            None => self.set(name, dir.into_owned()),
        }
    }

    /// Finds an executable on this environment's `PATH`.
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        let path = self.get("PATH")?;
        let cwd = std::env::current_dir().ok()?;
        which::which_in(program, Some(path), cwd).ok()
    }

    /// Creates a command that runs with exactly this environment.
    ///
    /// The program is resolved against this environment's `PATH` so that
    /// tools installed during the bootstrap are found.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        Command::from(self.std_command(program))
    }

    /// Creates a standard library command that runs with exactly this
    /// environment.
    pub fn std_command(&self, program: impl AsRef<OsStr>) -> std::process::Command {
        let program = program.as_ref();
        let resolved = program
            .to_str()
            .filter(|p| !p.contains('/'))
            .and_then(|p| self.which(p))
            .map(PathBuf::into_os_string)
            .unwrap_or_else(|| program.to_os_string());

        let mut command = std::process::Command::new(resolved);
        command.env_clear().envs(self.vars.iter());
        command
    }

    /// Computes the changes needed to turn this environment into `after`.
    pub fn diff(&self, after: &ProcessEnvironment) -> EnvDelta {
        let ignored = |k: &str| SHELL_VARIABLES.contains(&k);

        let set = after
            .vars
            .iter()
            .filter(|(k, v)| !ignored(k.as_str()) && self.vars.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removed = self
            .vars
            .keys()
            .filter(|k| !ignored(k.as_str()) && !after.vars.contains_key(*k))
            .cloned()
            .collect();

        EnvDelta { set, removed }
    }

    /// Merges a delta into this environment.
    pub fn apply(&mut self, delta: &EnvDelta) {
        for name in &delta.removed {
            self.vars.remove(name);
        }

        for (name, value) in &delta.set {
            self.vars.insert(name.clone(), value.clone());
        }
    }

    /// Runs a bash snippet and merges the variables it exported into this
    /// environment.
    ///
    /// The snippet runs in `cwd` with this environment. Its output is
    /// captured under `label`. If the snippet fails or its environment
    /// cannot be recovered, nothing is merged.
    pub async fn source(
        &mut self,
        logs: &LogCapture,
        label: &str,
        snippet: &str,
        cwd: &Path,
    ) -> Result<EnvDelta> {
        let dump = tempfile::NamedTempFile::new()
            .map_err(|e| BootstrapError::io("failed to create environment dump file", e))?;
        let dump_path = dump.path().to_string_lossy().into_owned();
        let quoted = shlex::try_quote(&dump_path).map_err(|_| {
            BootstrapError::Precondition(format!(
                "temporary path `{dump_path}` cannot be quoted for the shell"
            ))
        })?;

        // The dump is written on exit so that scripts ending in `exit 0` still
        // report their environment.
        let script = format!(
            "__gantry_dump() {{\n  __gantry_status=$?\n  if [ \"$__gantry_status\" -eq 0 ]; then env \
             -0 > {quoted}; fi\n  exit \"$__gantry_status\"\n}}\ntrap __gantry_dump EXIT\n{snippet}\n"
        );

        let mut command = self.command("bash");
        command.arg("-c").arg(script).current_dir(cwd);
        logs.capture(label, &mut command).await?;

        let contents = tokio::fs::read(dump.path())
            .await
            .map_err(|e| BootstrapError::io("failed to read environment dump file", e))?;
        if contents.is_empty() {
            return Err(BootstrapError::Precondition(format!(
                "`{label}` did not report its environment; was the exit trap replaced?"
            )));
        }

        let after = parse_env_dump(&contents);
        let delta = self.diff(&after);
        self.apply(&delta);
        Ok(delta)
    }
}

/// Parses the NUL-separated output of `env -0`.
fn parse_env_dump(contents: &[u8]) -> ProcessEnvironment {
    ProcessEnvironment::from_vars(
        contents
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let entry = String::from_utf8_lossy(entry);
                let (k, v) = entry.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            }),
    )
}
