//! ---
//! gl_section: "01-core-functionality"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Application configuration with TOML loading and environment overrides."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_deployment_id() -> String {
    "id1".to_owned()
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(45)
}

fn default_controller_sender() -> String {
    "A".to_owned()
}

fn default_worker_sender() -> String {
    "B".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_step_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_points() -> Vec<[f64; 2]> {
    vec![[10.0, 5.0], [12.3, -7.5], [0.0, 0.0], [-5.2, 8.1]]
}

fn default_cache_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Which side of the conversation a process plays.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Issues commands and collects results.
    Controller,
    /// Executes commands and publishes telemetry.
    Worker,
}

impl PeerRole {
    /// Prefix used for the MQTT client id.
    pub fn client_prefix(&self) -> &'static str {
        match self {
            PeerRole::Controller => "A",
            PeerRole::Worker => "B",
        }
    }
}

/// Primary configuration object, built once at start-up and passed by reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file existed and defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "GEARLINK_CONFIG";
    pub const ENV_BROKER_HOST: &'static str = "MQTT_BROKER_IP";
    pub const ENV_BROKER_PORT: &'static str = "MQTT_PORT";
    pub const ENV_DEPLOYMENT_ID: &'static str = "MQTT_CLIENT_ID";
    pub const ENV_KEEP_ALIVE: &'static str = "MQTT_KEEPALIVE";

    /// Load configuration and apply environment overrides.
    ///
    /// Resolution order: `explicit`, then `GEARLINK_CONFIG`, then the first
    /// existing candidate, finally [`AppConfig::default`].
    pub fn load_with_source<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        let env_path = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let source = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(path),
            None => candidates
                .iter()
                .map(|candidate| candidate.as_ref())
                .find(|candidate| candidate.exists())
                .map(Path::to_path_buf),
        };

        let mut config = match &source {
            Some(path) => Self::from_path(path)?,
            None => {
                debug!("no configuration file found; using defaults");
                AppConfig::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(LoadedAppConfig { config, source })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply the broker environment variables through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(Self::ENV_BROKER_HOST) {
            self.bus.host = host;
        }
        if let Some(port) = lookup(Self::ENV_BROKER_PORT) {
            self.bus.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got {port:?}", Self::ENV_BROKER_PORT))?;
        }
        if let Some(id) = lookup(Self::ENV_DEPLOYMENT_ID) {
            self.bus.deployment_id = id;
        }
        if let Some(keep_alive) = lookup(Self::ENV_KEEP_ALIVE) {
            let seconds: u64 = keep_alive.trim().parse().with_context(|| {
                format!("{} must be a number of seconds, got {keep_alive:?}", Self::ENV_KEEP_ALIVE)
            })?;
            self.bus.keep_alive = Duration::from_secs(seconds);
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.bus.deployment_id.trim().is_empty() {
            return Err(anyhow!("bus.deployment_id must not be empty"));
        }
        if self.bus.deployment_id.contains(['/', '+', '#']) {
            return Err(anyhow!(
                "bus.deployment_id {:?} must not contain topic separators or wildcards",
                self.bus.deployment_id
            ));
        }
        if self.workflow.request_timeout.is_zero() {
            return Err(anyhow!("workflow.request_timeout must be positive"));
        }
        if self.workflow.max_attempts == 0 {
            return Err(anyhow!("workflow.max_attempts must be at least 1"));
        }
        if self.executor.cache_capacity == 0 {
            return Err(anyhow!("executor.cache_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Broker connection and peer naming.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `{ID}` in the `v1/{ID}/...` topic space.
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_controller_sender")]
    pub controller_sender: String,
    #[serde(default = "default_worker_sender")]
    pub worker_sender: String,
}

impl BusConfig {
    /// MQTT client id for a role, `A-{ID}` or `B-{ID}`.
    pub fn client_id(&self, role: PeerRole) -> String {
        format!("{}-{}", role.client_prefix(), self.deployment_id)
    }

    /// Logical sender name stamped on messages of a role.
    pub fn sender(&self, role: PeerRole) -> &str {
        match role {
            PeerRole::Controller => &self.controller_sender,
            PeerRole::Worker => &self.worker_sender,
        }
    }

    /// Username/password pair when both are configured.
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            deployment_id: default_deployment_id(),
            host: default_host(),
            port: default_port(),
            keep_alive: default_keep_alive(),
            username: None,
            password: None,
            controller_sender: default_controller_sender(),
            worker_sender: default_worker_sender(),
        }
    }
}

/// Local defaults for orchestrated sessions.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Per-attempt reply timeout.
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Publishes per work item, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "step_interval_ms", default = "default_step_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub step_interval: Duration,
    /// Points visited by a session started from the bus.
    #[serde(default = "default_points")]
    pub points: Vec<[f64; 2]>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            step_interval: default_step_interval(),
            points: default_points(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Recently completed correlation ids kept for reply replay.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Whether the simulated handler sleeps for movement and analysis.
    #[serde(default = "default_true")]
    pub simulate_delay: bool,
    /// Send one `ctrl/start` after connecting.
    #[serde(default)]
    pub auto_start: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            simulate_delay: true,
            auto_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
