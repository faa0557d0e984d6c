//! The terminal handoff to the user's payload.
//!
//! [`handoff`] never returns on success: the bootstrap process is replaced by
//! the payload (or by a shell running the payload), so signals delivered to the
//! container's top-level process reach the payload directly and the payload's
//! exit code becomes the container's exit code.

use std::convert::Infallible;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use crate::BootstrapError;
use crate::Result;
use crate::context::BootstrapContext;
use crate::environment::ProcessEnvironment;

/// The read timeout, in seconds, for the launcher's static rendezvous.
const RDZV_READ_TIMEOUT_SECS: u32 = 420;

/// How the payload is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMethod {
    /// Replace the bootstrap process with the payload.
    #[default]
    Exec,
    /// Replace the bootstrap process with `bash -c`, allowing variable
    /// expansion in the payload's arguments.
    Shell,
}

impl FromStr for ExecMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exec" => Ok(Self::Exec),
            "bash" | "shell" => Ok(Self::Shell),
            _ => Err("expected `exec` or `bash`".to_string()),
        }
    }
}

impl fmt::Display for ExecMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Shell => write!(f, "bash"),
        }
    }
}

/// Builds the final argument vector for the payload.
///
/// When the distributed launcher was requested and this is a multi-node
/// accelerated job, the arguments are wrapped with `torchrun`; otherwise they
/// are returned unchanged.
pub fn payload_args(ctx: &BootstrapContext, args: &[String]) -> Vec<String> {
    if !ctx.use_torchrun || !ctx.node.is_multi_node_accelerated() {
        return args.to_vec();
    }

    let (Some(rdzv), Some(count), Some(rank), Some(leader)) = (
        ctx.rendezvous,
        ctx.node.replica_count,
        ctx.node.replica_rank,
        ctx.node.leader_hostname.as_deref(),
    ) else {
        return args.to_vec();
    };

    let mut wrapped = vec![
        "torchrun".to_string(),
        format!("--nnodes={count}:{count}"),
        format!("--nproc-per-node={gpus}", gpus = ctx.node.gpus),
        format!("--rdzv-id={id}", id = rdzv.id),
        "--rdzv-backend=static".to_string(),
        format!("--rdzv-endpoint={leader}:{port}", port = rdzv.port),
        format!("--node-rank={rank}"),
        format!("--rdzv-conf=read_timeout={RDZV_READ_TIMEOUT_SECS}"),
    ];

    if !args.first().is_some_and(|a| a.ends_with(".py")) {
        wrapped.push("--no-python".to_string());
    }

    wrapped.extend(args.iter().cloned());
    wrapped
}

/// Hands off execution to the payload.
///
/// On success this function does not return. An error is returned only if
/// the payload could not be started at all.
pub fn handoff(
    env: &ProcessEnvironment,
    cwd: &Path,
    method: ExecMethod,
    args: &[String],
) -> Result<Infallible> {
    let Some((program, rest)) = args.split_first() else {
        return Err(BootstrapError::Precondition(
            "no command was given to execute".to_string(),
        ));
    };

    let mut command = match method {
        ExecMethod::Exec => {
            let mut command = env.std_command(program);
            command.args(rest);
            command
        }
        ExecMethod::Shell => {
            let mut command = env.std_command("bash");
            command.arg("-c").arg(args.join(" "));
            command
        }
    };

    info!(method = %method, command = %args.join(" "), "handing off to payload");
    let source = command.current_dir(cwd).exec();
    Err(BootstrapError::Exec {
        program: match method {
            ExecMethod::Exec => program.clone(),
            ExecMethod::Shell => "bash".to_string(),
        },
        source,
    })
}
