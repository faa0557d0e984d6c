//! Implementation of launcher configuration.
//!
//! Configuration is layered, from lowest to highest precedence:
//!
//! 1. built-in defaults;
//! 2. the user's `gantry/config.toml` in the platform configuration
//!    directory;
//! 3. a `gantry.toml` in the current directory;
//! 4. a file given with `--config`;
//! 5. environment variables such as `GANTRY__SERVICE__URL`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::ValueEnum;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

/// The name of the user configuration file.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The name of the project configuration file.
pub const PROJECT_CONFIG_FILE_NAME: &str = "gantry.toml";

/// The prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "GANTRY";

/// The separator between the prefix and the keys of configuration
/// environment variables.
pub const ENV_SEPARATOR: &str = "__";

/// The default container image.
pub const DEFAULT_IMAGE: &str = "ai2/cuda12.8-ubuntu22.04-torch2.6.0";

/// The default name of the workspace secret holding a GitHub token.
pub const DEFAULT_GH_TOKEN_SECRET: &str = "GITHUB_TOKEN";

/// The default dataset holding the `gantry` binary for containers.
pub const DEFAULT_ENTRYPOINT_DATASET: &str = "gantry/entrypoint";

/// The string that replaces redacted serialization fields.
const REDACTED: &str = "<REDACTED>";

/// Represents a secret string that is, by default, redacted for serialization.
///
/// This type is a wrapper around [`secrecy::SecretString`].
#[derive(Debug, Clone)]
pub struct SecretString {
    /// The inner secret string.
    inner: secrecy::SecretString,
    /// Whether or not the secret string is redacted for serialization.
    redacted: bool,
}

impl SecretString {
    /// Redacts the secret for serialization.
    pub fn redact(&mut self) {
        self.redacted = true;
    }

    /// Unredacts the secret for serialization.
    pub fn unredact(&mut self) {
        self.redacted = false;
    }

    /// Gets the inner [`secrecy::SecretString`].
    pub fn inner(&self) -> &secrecy::SecretString {
        &self.inner
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self {
            inner: s.into(),
            redacted: true,
        }
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self {
            inner: s.into(),
            redacted: true,
        }
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.redacted {
            serializer.serialize_str(REDACTED)
        } else {
            serializer.serialize_str(self.inner.expose_secret())
        }
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = secrecy::SecretString::deserialize(deserializer)?;
        Ok(Self {
            inner,
            redacted: true,
        })
    }
}

/// The Python package manager used inside the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PythonManager {
    /// `uv`.
    Uv,
    /// `conda`.
    Conda,
}

impl std::fmt::Display for PythonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uv => write!(f, "uv"),
            Self::Conda => write!(f, "conda"),
        }
    }
}

/// Represents the configuration for the Gantry CLI tool.
///
/// <div class="warning">
///
/// By default, serialization of [`Config`] will redact the values of secrets.
///
/// Use the [`Config::unredact`] method before serialization to prevent the
/// secrets from being redacted.
///
/// </div>
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Job service configuration.
    #[serde(default)]
    pub service: ServiceConfig,
    /// The default workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// The default budget account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    /// The name of the workspace secret holding a GitHub token.
    #[serde(default = "default_gh_token_secret")]
    pub gh_token_secret: String,
    /// Configuration for the `run` command.
    #[serde(default)]
    pub run: RunConfig,
    /// Configuration for following jobs.
    #[serde(default)]
    pub follow: FollowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: Default::default(),
            workspace: None,
            budget: None,
            gh_token_secret: default_gh_token_secret(),
            run: Default::default(),
            follow: Default::default(),
        }
    }
}

/// Gets the default GitHub token secret name.
fn default_gh_token_secret() -> String {
    DEFAULT_GH_TOKEN_SECRET.to_string()
}

/// Represents the job service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ServiceConfig {
    /// The base URL of the job service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// The token used to authenticate with the job service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<SecretString>,
    /// Accept invalid TLS certificates from the job service.
    #[serde(default)]
    pub insecure: bool,
}

impl ServiceConfig {
    /// Gets the URL of the job service.
    pub fn url(&self) -> Result<&Url> {
        self.url
            .as_ref()
            .context("configuration value `service.url` is required")
    }
}

/// Represents the configuration for the `run` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct RunConfig {
    /// The default container image.
    pub image: String,
    /// The path of the results directory inside the container.
    pub results_dir: String,
    /// The path the source is cloned to inside the container.
    pub runtime_dir: String,
    /// The dataset holding the `gantry` binary for containers.
    pub entrypoint_dataset: String,
    /// The default Python package manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_manager: Option<PythonManager>,
    /// The default Python version for new environments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_python_version: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            results_dir: crate::job::DEFAULT_RESULTS_DIR.to_string(),
            runtime_dir: gantry_bootstrap::context::DEFAULT_RUNTIME_DIR.to_string(),
            entrypoint_dataset: DEFAULT_ENTRYPOINT_DATASET.to_string(),
            python_manager: None,
            default_python_version: None,
        }
    }
}

/// Represents the configuration for following jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct FollowConfig {
    /// The number of seconds between polls of a job's state.
    pub poll_interval: u64,
    /// A Slack incoming webhook notified about followed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_webhook_url: Option<SecretString>,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval: 2,
            slack_webhook_url: None,
        }
    }
}

impl FollowConfig {
    /// Gets the interval between polls of a job's state.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl Config {
    /// Loads the configuration from every source.
    ///
    /// `explicit` is a configuration file given on the command line; unlike
    /// the other files, it must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut files = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            files.push(dir.join("gantry").join(CONFIG_FILE_NAME));
        }
        files.push(PathBuf::from(PROJECT_CONFIG_FILE_NAME));

        Self::load_from(&files, explicit, None)
    }

    /// Loads the configuration from the given optional files, an explicit
    /// file, and environment variables.
    ///
    /// When `env` is `None`, the process environment is used.
    pub fn load_from(
        files: &[PathBuf],
        explicit: Option<&Path>,
        env: Option<Vec<(String, String)>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        for file in files {
            builder = builder.add_source(config::File::from(file.as_path()).required(false));
        }

        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .source(env.map(|vars| vars.into_iter().collect())),
        );

        let config: Self = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates a configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.service.url
            && !matches!(url.scheme(), "http" | "https")
        {
            bail!("configuration value `service.url` must be an HTTP or HTTPS URL");
        }

        if self.gh_token_secret.is_empty() {
            bail!("configuration value `gh_token_secret` cannot be empty");
        }

        if self.run.image.is_empty() {
            bail!("configuration value `run.image` cannot be empty");
        }

        for (name, value) in [
            ("run.results_dir", &self.run.results_dir),
            ("run.runtime_dir", &self.run.runtime_dir),
        ] {
            if !value.starts_with('/') {
                bail!("configuration value `{name}` must be an absolute path");
            }
        }

        if self.follow.poll_interval == 0 {
            bail!("configuration value `follow.poll_interval` cannot be zero");
        }

        if let Some(webhook) = &self.follow.slack_webhook_url {
            let url = Url::parse(webhook.inner().expose_secret()).map_err(|_| {
                anyhow::anyhow!("configuration value `follow.slack_webhook_url` is not a valid URL")
            })?;
            if url.scheme() != "https" {
                bail!("configuration value `follow.slack_webhook_url` must be an HTTPS URL");
            }
        }

        Ok(())
    }

    /// Redacts the secrets contained in the configuration.
    ///
    /// By default, secrets are redacted for serialization.
    pub fn redact(&mut self) {
        if let Some(token) = &mut self.service.token {
            token.redact();
        }
        if let Some(webhook) = &mut self.follow.slack_webhook_url {
            webhook.redact();
        }
    }

    /// Unredacts the secrets contained in the configuration.
    ///
    /// Calling this method will expose secrets for serialization.
    pub fn unredact(&mut self) {
        if let Some(token) = &mut self.service.token {
            token.unredact();
        }
        if let Some(webhook) = &mut self.follow.slack_webhook_url {
            webhook.unredact();
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<Vec<(String, String)>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults() {
        let config = Config::load_from(&[], None, env(&[])).unwrap();
        assert_eq!(config.gh_token_secret, DEFAULT_GH_TOKEN_SECRET);
        assert_eq!(config.run.results_dir, "/results");
        assert_eq!(config.run.runtime_dir, "/gantry-runtime");
        assert_eq!(config.follow.poll_interval(), Duration::from_secs(2));
        assert_eq!(
            config.service.url().unwrap_err().to_string(),
            "configuration value `service.url` is required"
        );
    }

    #[test]
    fn layers_take_precedence_in_order() {
        let dir = tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        std::fs::write(
            &user,
            "workspace = \"ai2/user\"\nbudget = \"ai2/user\"\n\n[service]\nurl = \"https://jobs.example.com\"\n",
        )
        .unwrap();
        std::fs::write(&project, "workspace = \"ai2/project\"\n").unwrap();

        let config = Config::load_from(
            &[user, project, dir.path().join("missing.toml")],
            None,
            env(&[("GANTRY__BUDGET", "ai2/env"), ("GANTRY_RUNTIME_DIR", "/ignored")]),
        )
        .unwrap();

        assert_eq!(config.workspace.as_deref(), Some("ai2/project"));
        assert_eq!(config.budget.as_deref(), Some("ai2/env"));
        assert_eq!(
            config.service.url().unwrap().as_str(),
            "https://jobs.example.com/"
        );
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempdir().unwrap();
        assert!(
            Config::load_from(&[], Some(&dir.path().join("missing.toml")), env(&[])).is_err()
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(&path, "[run]\nimage = \"x\"\ncolour = true\n").unwrap();
        assert!(Config::load_from(&[], Some(&path), env(&[])).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::load_from(&[], None, env(&[("GANTRY__FOLLOW__POLL_INTERVAL", "0")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration value `follow.poll_interval` cannot be zero"
        );
    }

    #[test]
    fn tokens_are_redacted() {
        let mut config = Config::default();
        config.service.token = Some("hunter2".into());

        let redacted = toml::to_string(&config).unwrap();
        assert!(redacted.contains(REDACTED));
        assert!(!redacted.contains("hunter2"));

        config.unredact();
        assert!(toml::to_string(&config).unwrap().contains("hunter2"));
    }

    #[test]
    fn slack_webhooks_are_secret() {
        let webhook = "https://hooks.slack.com/services/T000/B000/XXXX";
        let mut config = Config::load_from(
            &[],
            None,
            env(&[("GANTRY__FOLLOW__SLACK_WEBHOOK_URL", webhook)]),
        )
        .unwrap();
        assert!(!toml::to_string(&config).unwrap().contains(webhook));

        config.unredact();
        assert!(toml::to_string(&config).unwrap().contains(webhook));

        let err = Config::load_from(
            &[],
            None,
            env(&[("GANTRY__FOLLOW__SLACK_WEBHOOK_URL", "http://hooks.example.com")]),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration value `follow.slack_webhook_url` must be an HTTPS URL"
        );
    }
}
