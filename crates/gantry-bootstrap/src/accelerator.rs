//! Accelerator networking configuration for multi-node jobs.
//!
//! Configuration is best-effort: a node whose hardware cannot be identified
//! keeps the default transport. Nothing in this module fails the bootstrap.

use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::context::BootstrapContext;
use crate::environment::ProcessEnvironment;
use crate::logs::LogCapture;

/// The directory whose presence indicates an InfiniBand interconnect.
pub const INFINIBAND_DIR: &str = "/sys/class/infiniband";

/// The directory holding the TCPXO networking plugin.
pub const TCPXO_DIR: &str = "/var/lib/tcpxo/lib64";

/// The locations checked to identify the node's networking hardware.
#[derive(Debug, Clone)]
pub struct HardwarePaths {
    /// The InfiniBand device class directory.
    pub infiniband: PathBuf,
    /// The TCPXO plugin directory.
    pub tcpxo: PathBuf,
}

impl Default for HardwarePaths {
    fn default() -> Self {
        Self {
            infiniband: PathBuf::from(INFINIBAND_DIR),
            tcpxo: PathBuf::from(TCPXO_DIR),
        }
    }
}

/// The networking profile applied to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorProfile {
    /// No profile was applied.
    None,
    /// The high-speed interconnect profile.
    Interconnect,
    /// The cloud accelerated-networking profile.
    CloudNetworking,
}

/// Configures collective-communication networking for the node.
///
/// Only multi-node accelerated jobs that have not opted out are configured.
/// The interconnect profile takes precedence when both kinds of hardware are
/// present.
pub async fn configure_accelerator(
    ctx: &BootstrapContext,
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    paths: &HardwarePaths,
) -> AcceleratorProfile {
    if !ctx.node.is_multi_node_accelerated() {
        debug!("not a multi-node accelerated job; skipping NCCL configuration");
        return AcceleratorProfile::None;
    }

    if ctx.skip_nccl_setup {
        info!("NCCL configuration was disabled");
        return AcceleratorProfile::None;
    }

    if paths.infiniband.is_dir() {
        env.set("NCCL_IB_HCA", "^=mlx5_bond_0");
        env.set("NCCL_SOCKET_IFNAME", "ib");
        info!("configured NCCL for InfiniBand");
        return AcceleratorProfile::Interconnect;
    }

    if paths.tcpxo.is_dir() {
        let mut staged = env.clone();
        match cloud_networking(&mut staged, logs, &paths.tcpxo).await {
            Ok(()) => {
                *env = staged;
                info!("configured NCCL for TCPXO");
                return AcceleratorProfile::CloudNetworking;
            }
            Err(e) => {
                warn!("failed to configure NCCL for TCPXO; using the default transport: {e}");
                return AcceleratorProfile::None;
            }
        }
    }

    warn!("no supported interconnect was detected; using the default NCCL transport");
    AcceleratorProfile::None
}

/// Applies the TCPXO profile.
async fn cloud_networking(
    env: &mut ProcessEnvironment,
    logs: &LogCapture,
    dir: &Path,
) -> crate::Result<()> {
    env.prepend_path("LD_LIBRARY_PATH", dir);

    let profile = dir.join("nccl-env-profile.sh");
    let path = profile.to_string_lossy();
    let quoted = shlex::try_quote(&path).map_err(|_| {
        crate::BootstrapError::Precondition(format!(
            "path `{path}` cannot be quoted for the shell"
        ))
    })?;
    env.source(logs, "nccl-env-profile", &format!("source {quoted}"), dir)
        .await?;

    env.set("NCCL_PROTO", "Simple,LL128");
    env.set(
        "NCCL_TUNER_CONFIG_PATH",
        dir.join("a3plus_tuner_config_ll128.textproto")
            .display()
            .to_string(),
    );
    env.set(
        "NCCL_SHIMNET_GUEST_CONFIG_CHECKER_CONFIG_FILE",
        dir.join("a3plus_guest_config_ll128.textproto")
            .display()
            .to_string(),
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    use super::*;

    fn context(extra: &[(&str, &str)]) -> BootstrapContext {
        let mut env = ProcessEnvironment::from_vars([
            ("GITHUB_REPO", "allenai/example"),
            ("GIT_REF", "main"),
            ("RESULTS_DIR", "/results"),
            ("BEAKER_NODE_HOSTNAME", "node-0"),
            ("BEAKER_NODE_ID", "01ABC"),
            ("BEAKER_ASSIGNED_GPU_COUNT", "8"),
            ("BEAKER_REPLICA_COUNT", "2"),
            ("BEAKER_REPLICA_RANK", "0"),
            ("BEAKER_LEADER_REPLICA_HOSTNAME", "node-0"),
        ]);
        for (k, v) in extra {
            env.set(*k, *v);
        }
        BootstrapContext::from_env(&env).unwrap()
    }

    struct Hardware {
        dir: TempDir,
        paths: HardwarePaths,
        logs: LogCapture,
    }

    async fn hardware() -> Hardware {
        let dir = tempdir().unwrap();
        let paths = HardwarePaths {
            infiniband: dir.path().join("infiniband"),
            tcpxo: dir.path().join("tcpxo"),
        };
        let logs = LogCapture::new(&dir.path().join("results"));
        logs.create_dir().await.unwrap();
        Hardware { dir, paths, logs }
    }

    fn base_env() -> ProcessEnvironment {
        ProcessEnvironment::from_vars([(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()),
        )])
    }

    #[tokio::test]
    async fn infiniband_profile() {
        let hw = hardware().await;
        std::fs::create_dir(&hw.paths.infiniband).unwrap();
        std::fs::create_dir(&hw.paths.tcpxo).unwrap();
        let mut env = base_env();

        let profile = configure_accelerator(&context(&[]), &mut env, &hw.logs, &hw.paths).await;

        assert_eq!(profile, AcceleratorProfile::Interconnect);
        assert_eq!(env.get("NCCL_IB_HCA"), Some("^=mlx5_bond_0"));
        assert_eq!(env.get("NCCL_SOCKET_IFNAME"), Some("ib"));
        assert_eq!(env.get("NCCL_PROTO"), None);
    }

    #[tokio::test]
    async fn tcpxo_profile_overrides_sourced_values() {
        let hw = hardware().await;
        std::fs::create_dir(&hw.paths.tcpxo).unwrap();
        std::fs::write(
            hw.paths.tcpxo.join("nccl-env-profile.sh"),
            "export NCCL_PROTO=LL\nexport NCCL_FASTRAK_CTRL_DEV=eth0\n",
        )
        .unwrap();
        let mut env = base_env();

        let profile = configure_accelerator(&context(&[]), &mut env, &hw.logs, &hw.paths).await;

        let dir = hw.dir.path().join("tcpxo");
        assert_eq!(profile, AcceleratorProfile::CloudNetworking);
        assert_eq!(env.get("NCCL_PROTO"), Some("Simple,LL128"));
        assert_eq!(env.get("NCCL_FASTRAK_CTRL_DEV"), Some("eth0"));
        assert_eq!(
            env.get("NCCL_TUNER_CONFIG_PATH"),
            Some(
                dir.join("a3plus_tuner_config_ll128.textproto")
                    .display()
                    .to_string()
                    .as_str()
            )
        );
        assert_eq!(
            env.get("LD_LIBRARY_PATH"),
            Some(dir.display().to_string().as_str())
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_profile_leaves_environment_untouched() {
        let hw = hardware().await;
        std::fs::create_dir(&hw.paths.tcpxo).unwrap();
        std::fs::write(hw.paths.tcpxo.join("nccl-env-profile.sh"), "exit 3\n").unwrap();
        let mut env = base_env();
        let before = env.clone();

        let profile = configure_accelerator(&context(&[]), &mut env, &hw.logs, &hw.paths).await;

        assert_eq!(profile, AcceleratorProfile::None);
        assert_eq!(env, before);
        assert!(logs_contain("using the default transport"));
    }

    #[tokio::test]
    async fn skipped_when_disabled_or_single_node() {
        let hw = hardware().await;
        std::fs::create_dir(&hw.paths.infiniband).unwrap();

        for ctx in [
            context(&[("GANTRY_SKIP_NCCL_SETUP", "1")]),
            context(&[("BEAKER_REPLICA_COUNT", "1")]),
            context(&[("BEAKER_ASSIGNED_GPU_COUNT", "0")]),
        ] {
            let mut env = base_env();
            let profile = configure_accelerator(&ctx, &mut env, &hw.logs, &hw.paths).await;
            assert_eq!(profile, AcceleratorProfile::None);
            assert_eq!(env.get("NCCL_IB_HCA"), None);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_hardware_is_not_an_error() {
        let hw = hardware().await;
        let mut env = base_env();

        let profile = configure_accelerator(&context(&[]), &mut env, &hw.logs, &hw.paths).await;

        assert_eq!(profile, AcceleratorProfile::None);
        assert!(logs_contain("no supported interconnect was detected"));
    }
}
