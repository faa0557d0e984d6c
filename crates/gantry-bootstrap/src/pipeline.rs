//! The bootstrap pipeline.
//!
//! The stages run strictly in order, each at most once:
//!
//! ```text
//! validate -> clone -> credentials -> pre-setup -> runtime -> accelerator
//!          -> post-setup -> handoff
//! ```
//!
//! Any failure before the handoff ends the bootstrap; the payload is never
//! started with a partially constructed environment.

use std::convert::Infallible;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use secrecy::ExposeSecret;
use secrecy::SecretString;
use tracing::error;
use tracing::info;

use crate::BootstrapError;
use crate::Result;
use crate::accelerator::AcceleratorProfile;
use crate::accelerator::HardwarePaths;
use crate::accelerator::configure_accelerator;
use crate::context::BootstrapContext;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;
use crate::payload::handoff;
use crate::payload::payload_args;
use crate::runtime::RuntimeEnvironment;
use crate::runtime::construct_runtime;
use crate::source::clone_source;
use crate::tools::ToolInstaller;

/// The file the Google Cloud credentials are written to, inside the runtime
/// directory.
pub const GOOGLE_CREDENTIALS_FILE: &str = ".gantry-google-credentials.json";

/// A bootstrap procedure for one container.
#[derive(Debug)]
pub struct Bootstrap {
    /// The environment the payload inherits.
    env: ProcessEnvironment,
    /// The locations checked for networking hardware.
    paths: HardwarePaths,
}

/// A bootstrapped container, ready to hand off to the payload.
#[derive(Debug)]
pub struct Prepared {
    /// The validated context.
    pub context: BootstrapContext,
    /// The environment the payload runs with.
    pub env: ProcessEnvironment,
    /// The commit that was checked out.
    pub commit: String,
    /// The Python environment, unless Python was disabled.
    pub runtime: Option<RuntimeEnvironment>,
    /// The networking profile applied to the node.
    pub accelerator: AcceleratorProfile,
    /// The payload command line, including any launcher wrapper.
    pub args: Vec<String>,
}

impl Bootstrap {
    /// Creates a bootstrap procedure starting from the given environment.
    pub fn new(env: ProcessEnvironment) -> Self {
        Self {
            env,
            paths: HardwarePaths::default(),
        }
    }

    /// Sets the locations checked for networking hardware.
    pub fn with_hardware_paths(mut self, paths: HardwarePaths) -> Self {
        self.paths = paths;
        self
    }

    /// Runs the bootstrap and hands off to the payload.
    ///
    /// Returns only on failure.
    pub async fn run(self, args: &[String]) -> Result<Infallible> {
        let started = Instant::now();
        let prepared = self.prepare(args).await?;
        info!(
            elapsed = ?started.elapsed(),
            "setup complete"
        );

        info!(stage = "handoff", "running payload");
        handoff(
            &prepared.env,
            &prepared.context.runtime_dir,
            prepared.context.exec_method,
            &prepared.args,
        )
        .inspect_err(|e| error!("{e}"))
    }

    /// Runs every stage before the handoff.
    ///
    /// A failure is logged, naming the captured log of the failed command when
    /// there is one.
    pub async fn prepare(self, args: &[String]) -> Result<Prepared> {
        self.stages(args).await.inspect_err(|e| match e.log() {
            Some(log) => error!(log = %log.display(), "bootstrap failed: {e}"),
            None => error!("bootstrap failed: {e}"),
        })
    }

    /// Runs the stages in order.
    async fn stages(self, args: &[String]) -> Result<Prepared> {
        let Self { mut env, paths } = self;

        info!(stage = "validate", "validating environment");
        if args.is_empty() {
            return Err(BootstrapError::Precondition(
                "no command was given to execute".to_string(),
            ));
        }
        let ctx = BootstrapContext::from_env(&env)?;
        info!(
            repo = %ctx.repo,
            reference = %ctx.git_ref,
            host = %ctx.node.hostname,
            node = %ctx.node.id,
            gpus = ctx.node.gpus,
            task = ctx.task_name.as_deref(),
            version = ctx.launcher_version.as_deref(),
            "bootstrapping job"
        );

        let logs = LogCapture::new(&ctx.results_dir);
        logs.create_dir().await?;
        let tools = ToolInstaller::new(&env, &logs)?;

        info!(stage = "source", "cloning source");
        let commit = clone_source(&ctx, &mut env, &logs, &tools).await?;

        info!(stage = "credentials", "writing credentials");
        write_credentials(&ctx, &mut env).await?;

        if let Some(cmd) = &ctx.pre_setup {
            info!(stage = "pre-setup", "running pre-setup command");
            env.source(&logs, "pre-setup", cmd, &ctx.runtime_dir)
                .await?;
        }

        let runtime = match &ctx.python {
            Some(settings) => {
                info!(stage = "runtime", "constructing Python environment");
                Some(
                    construct_runtime(
                        settings,
                        &ctx.runtime_dir,
                        &ctx.results_dir,
                        &mut env,
                        &logs,
                        &tools,
                    )
                    .await?,
                )
            }
            None => {
                info!(stage = "runtime", "Python environment construction is disabled");
                None
            }
        };

        info!(stage = "accelerator", "configuring accelerators");
        let accelerator = configure_accelerator(&ctx, &mut env, &logs, &paths).await;

        if let Some(cmd) = &ctx.post_setup {
            info!(stage = "post-setup", "running post-setup command");
            env.source(&logs, "post-setup", cmd, &ctx.runtime_dir)
                .await?;
        }

        let args = payload_args(&ctx, args);
        Ok(Prepared {
            context: ctx,
            env,
            commit,
            runtime,
            accelerator,
            args,
        })
    }
}

/// Writes any cloud credentials passed to the container.
async fn write_credentials(ctx: &BootstrapContext, env: &mut ProcessEnvironment) -> Result<()> {
    let credentials = &ctx.credentials;
    if credentials.aws_config.is_some() || credentials.aws_credentials.is_some() {
        let home = env
            .get_non_empty("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                BootstrapError::Precondition(
                    "cannot write AWS credentials without a home directory".to_string(),
                )
            })?;
        let aws = home.join(".aws");
        tokio::fs::create_dir_all(&aws).await.map_err(|e| {
            BootstrapError::io(format!("failed to create `{}`", aws.display()), e)
        })?;

        if let Some(config) = &credentials.aws_config {
            write_secret(&aws.join("config"), config).await?;
        }
        if let Some(creds) = &credentials.aws_credentials {
            write_secret(&aws.join("credentials"), creds).await?;
        }
        info!(dir = %aws.display(), "wrote AWS credentials");
    }

    if let Some(google) = &credentials.google_credentials {
        let path = ctx.runtime_dir.join(GOOGLE_CREDENTIALS_FILE);
        write_secret(&path, google).await?;
        env.set("GOOGLE_APPLICATION_CREDENTIALS", path.display().to_string());
        info!(path = %path.display(), "wrote Google Cloud credentials");
    }

    Ok(())
}

/// Writes a secret to a file readable only by its owner.
async fn write_secret(path: &Path, secret: &SecretString) -> Result<()> {
    let err = |e| BootstrapError::io(format!("failed to write `{}`", path.display()), e);
    tokio::fs::write(path, secret.expose_secret())
        .await
        .map_err(err)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(err)
}
