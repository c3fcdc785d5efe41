//! Configuration for stratus.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StratusConfig {
    /// Control plane connection.
    #[serde(default)]
    pub control: ControlConfig,

    /// Outbound call throttling.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// State convergence polling.
    #[serde(default)]
    pub poller: PollerConfig,

    /// Step completion polling.
    #[serde(default)]
    pub steps: StepConfig,

    /// Remote shell access to cluster hosts.
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl StratusConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `stratus.toml` in the current directory (if present)
    /// 3. Environment variables with `STRATUS_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("stratus.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STRATUS_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Control plane connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Which control service implementation to use.
    #[serde(default)]
    pub backend: ControlBackend,

    /// Base URL of the control plane HTTP API.
    #[serde(default = "default_control_url")]
    pub url: String,

    /// Base URL of the step metadata API, if it is served separately.
    #[serde(default)]
    pub metadata_url: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_control_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_control_url() -> String {
    "http://localhost:8090".to_owned()
}

const fn default_control_timeout_secs() -> u64 {
    10
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            backend: ControlBackend::default(),
            url: default_control_url(),
            metadata_url: None,
            timeout_secs: default_control_timeout_secs(),
        }
    }
}

/// Type of control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBackend {
    /// REST control plane.
    #[default]
    Http,

    /// In-process control plane for testing.
    Memory,
}

/// Throttling of outbound control plane calls.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum time between the starts of two consecutive calls.
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Total attempts for a throttled call, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl ThrottleConfig {
    /// Minimum interval as a duration.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 0,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// State convergence polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Sleep between two reloads.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long a cluster may take to become ready.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// How long instances may take to terminate.
    #[serde(default = "default_terminate_timeout_secs")]
    pub terminate_timeout_secs: u64,
}

const fn default_poll_interval_secs() -> u64 {
    10
}

const fn default_startup_timeout_secs() -> u64 {
    600 // 10 minutes
}

const fn default_terminate_timeout_secs() -> u64 {
    120
}

impl PollerConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Startup timeout as a duration.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Terminate timeout as a duration.
    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            terminate_timeout_secs: default_terminate_timeout_secs(),
        }
    }
}

/// Step completion polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Sleep between two step status reloads.
    #[serde(default = "default_step_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

const fn default_step_poll_interval_secs() -> u64 {
    10
}

impl StepConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_step_poll_interval_secs(),
        }
    }
}

/// Remote shell access configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Login user on cluster hosts.
    #[serde(default = "default_remote_user")]
    pub user: String,

    /// SSH port.
    #[serde(default = "default_remote_port")]
    pub port: u16,

    /// Private key used to authenticate.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Retry connection establishment on transient failures.
    #[serde(default)]
    pub connect_retries: bool,

    /// `ssh` executable.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: PathBuf,

    /// `scp` executable.
    #[serde(default = "default_scp_program")]
    pub scp_program: PathBuf,
}

fn default_remote_user() -> String {
    "hadoop".to_owned()
}

const fn default_remote_port() -> u16 {
    22
}

fn default_ssh_program() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_scp_program() -> PathBuf {
    PathBuf::from("scp")
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: default_remote_user(),
            port: default_remote_port(),
            key_file: None,
            connect_retries: false,
            ssh_program: default_ssh_program(),
            scp_program: default_scp_program(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StratusConfig::default();
        assert_eq!(config.control.backend, ControlBackend::Http);
        assert_eq!(config.control.url, "http://localhost:8090");
        assert_eq!(config.throttle.min_interval(), Duration::ZERO);
        assert_eq!(config.throttle.max_attempts, 5);
        assert_eq!(config.poller.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.poller.startup_timeout(), Duration::from_secs(600));
        assert_eq!(config.remote.port, 22);
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [control]
            backend = "memory"
            url = "https://control.example.com"

            [throttle]
            min_interval_ms = 1000

            [remote]
            user = "ops"
            key_file = "/home/ops/.ssh/cluster.pem"
            connect_retries = true
        "#;

        let config: StratusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.control.backend, ControlBackend::Memory);
        assert_eq!(config.throttle.min_interval(), Duration::from_secs(1));
        assert_eq!(config.throttle.initial_backoff_ms, 500);
        assert_eq!(config.remote.user, "ops");
        assert!(config.remote.connect_retries);
        assert_eq!(config.steps.poll_interval_secs, 10);
    }
}
