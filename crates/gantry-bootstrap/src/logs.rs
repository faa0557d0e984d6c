//! Capturing the output of external commands to numbered log files.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use tokio::process::Command;
use tracing::debug;
use tracing::error;

use crate::BootstrapError;
use crate::Result;

/// The name of the hidden directory created inside the results directory.
pub const GANTRY_DIR_NAME: &str = ".gantry";

/// The name of the directory holding captured logs.
const LOGS_DIR_NAME: &str = "logs";

/// Captures the combined output of commands into sequentially numbered files.
#[derive(Debug)]
pub struct LogCapture {
    /// The directory the log files are written to.
    dir: PathBuf,
    /// The number of log files created so far.
    count: AtomicU32,
}

impl LogCapture {
    /// Creates a log capture writing into `<results>/.gantry/logs`.
    ///
    /// The directory is not created until [`LogCapture::create_dir`] is
    /// called.
    pub fn new(results_dir: &Path) -> Self {
        Self {
            dir: results_dir.join(GANTRY_DIR_NAME).join(LOGS_DIR_NAME),
            count: AtomicU32::new(0),
        }
    }

    /// Gets the directory the log files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the logs directory.
    pub async fn create_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            BootstrapError::io(
                format!("failed to create logs directory `{}`", self.dir.display()),
                e,
            )
        })
    }

    /// Allocates the path of the next log file for the given label.
    fn next_log(&self, label: &str) -> PathBuf {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let label: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{n:03}-{label}.log"))
    }

    /// Runs `command` with its stdout and stderr redirected to a new log file.
    ///
    /// If the command fails, the log's contents are echoed to stderr before a
    /// [`BootstrapError::CommandFailed`] is returned.
    pub async fn capture(&self, label: &str, command: &mut Command) -> Result<()> {
        let log = self.next_log(label);
        let file = create_log(&log)?;
        let stderr = file
            .try_clone()
            .map_err(|e| BootstrapError::io("failed to duplicate log file handle", e))?;

        debug!(label, log = %log.display(), "running command");
        let status = command
            .stdin(Stdio::null())
            .stdout(file)
            .stderr(stderr)
            .status()
            .await
            .map_err(|e| BootstrapError::Exec {
                program: program_name(command),
                source: e,
            })?;

        if status.success() {
            return Ok(());
        }

        echo_log(label, &log);
        Err(BootstrapError::CommandFailed {
            label: label.to_string(),
            status,
            log,
        })
    }

    /// Runs `command` and returns its stdout.
    ///
    /// Stderr goes to a new log file; stdout is appended to the same log
    /// after the command exits. Failure is handled as in
    /// [`LogCapture::capture`].
    pub async fn output(&self, label: &str, command: &mut Command) -> Result<String> {
        match self.run_for_output(label, command).await? {
            (Ok(stdout), _) => Ok(stdout),
            (Err(status), log) => {
                echo_log(label, &log);
                Err(BootstrapError::CommandFailed {
                    label: label.to_string(),
                    status,
                    log,
                })
            }
        }
    }

    /// Runs a command whose failure is an expected answer, not an error.
    ///
    /// Returns the command's stdout on success and `None` on a non-zero exit.
    /// The output is still captured to a log file, but nothing is echoed.
    pub async fn try_output(&self, label: &str, command: &mut Command) -> Result<Option<String>> {
        Ok(self.run_for_output(label, command).await?.0.ok())
    }

    /// Runs a command, capturing stdout and logging both streams.
    async fn run_for_output(
        &self,
        label: &str,
        command: &mut Command,
    ) -> Result<(Result<String, std::process::ExitStatus>, PathBuf)> {
        let log = self.next_log(label);
        let file = create_log(&log)?;

        debug!(label, log = %log.display(), "running command");
        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(file)
            .output()
            .await
            .map_err(|e| BootstrapError::Exec {
                program: program_name(command),
                source: e,
            })?;

        {
            use std::io::Write;

            let mut file = File::options()
                .append(true)
                .open(&log)
                .map_err(|e| BootstrapError::io("failed to reopen log file", e))?;
            file.write_all(&output.stdout)
                .map_err(|e| BootstrapError::io("failed to write log file", e))?;
        }

        if output.status.success() {
            Ok((Ok(String::from_utf8_lossy(&output.stdout).into_owned()), log))
        } else {
            Ok((Err(output.status), log))
        }
    }
}

/// Creates a log file.
fn create_log(path: &Path) -> Result<File> {
    File::create(path).map_err(|e| {
        BootstrapError::io(
            format!("failed to create log file `{}`", path.display()),
            e,
        )
    })
}

/// Gets the program name of a command for diagnostics.
fn program_name(command: &Command) -> String {
    command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned()
}

/// Echoes the contents of a failed command's log to stderr.
fn echo_log(label: &str, log: &Path) {
    error!(label, log = %log.display(), "command failed; captured output follows");
    match std::fs::read_to_string(log) {
        Ok(contents) => {
            for line in contents.lines() {
                eprintln!("  | {line}");
            }
        }
        Err(e) => error!(e = %e, "failed to read captured log"),
    }
}
