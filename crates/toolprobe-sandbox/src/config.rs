//! Configuration management.
//!
//! Configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`TOOLPROBE_*`, nested keys separated by `__`)
//! 2. Configuration file (TOML, or JSON when the path ends in `.json`)
//! 3. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! image = "val:latest"
//! name_prefix = "mcp-server-"
//! use_containers = true
//! env_script_path = "./env.sh"
//!
//! [timeouts]
//! stabilization_ms = 3000
//! probe_interval_ms = 2000
//!
//! [mcpServers.weather]
//! command = "python"
//! args = ["--directory", "./weather", "src/server.py"]
//! env = { API_KEY = "secret" }
//! ```
//!
//! The JSON layout used by MCP client configs (`{"mcpServers": {...}}`) is
//! accepted unchanged.

use crate::error::{Result, SandboxError};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default sandbox image.
pub const DEFAULT_IMAGE: &str = "val:latest";

/// Default prefix for sandbox names.
pub const DEFAULT_NAME_PREFIX: &str = "mcp-server-";

/// Default code root inside the sandbox.
pub const DEFAULT_SANDBOX_CODE_ROOT: &str = "/app/";

/// Default extension of the script a client runs.
pub const DEFAULT_SOURCE_EXTENSION: &str = ".py";

/// Default port advertised by a tool server.
pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TOOLPROBE_";

/// Launch configuration of one tool server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Command to run (e.g. `python`, `uv`).
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Environment overrides.
    pub env: BTreeMap<String, String>,
    /// Port the server listens on, if any.
    pub port: Option<u16>,
}

impl ClientConfig {
    /// Creates a client config from a command and arguments.
    #[must_use]
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            port: None,
        }
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Returns the configured port or the default.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Timing budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Delay between spawning a sandbox and the first probe.
    pub stabilization_ms: u64,
    /// Liveness probe cadence.
    pub probe_interval_ms: u64,
    /// Upper bound on the control-channel handshake.
    pub handshake_ms: u64,
    /// Upper bound on one runtime status query.
    pub inspect_ms: u64,
    /// Upper bound on one control-channel request after the handshake.
    pub request_ms: u64,
    /// Per-client kill during cleanup.
    pub client_kill_ms: u64,
    /// Per-item kill during the shutdown sweep.
    pub shutdown_kill_ms: u64,
    /// Per-item forced remove during the shutdown sweep.
    pub shutdown_force_remove_ms: u64,
    /// Whole-batch budget of the async sweep.
    pub batch_ms: u64,
    /// Per-item kill during the async sweep.
    pub batch_item_kill_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stabilization_ms: 3_000,
            probe_interval_ms: 2_000,
            handshake_ms: 60_000,
            inspect_ms: 2_000,
            request_ms: 60_000,
            client_kill_ms: 10_000,
            shutdown_kill_ms: 3_000,
            shutdown_force_remove_ms: 2_000,
            batch_ms: 10_000,
            batch_item_kill_ms: 5_000,
        }
    }
}

impl Timeouts {
    /// Timeouts with no stabilization delay and short budgets, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            stabilization_ms: 0,
            probe_interval_ms: 50,
            handshake_ms: 5_000,
            ..Self::default()
        }
    }

    /// Stabilization delay.
    #[must_use]
    pub const fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    /// Probe cadence.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Handshake budget.
    #[must_use]
    pub const fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    /// Status query budget.
    #[must_use]
    pub const fn inspect(&self) -> Duration {
        Duration::from_millis(self.inspect_ms)
    }

    /// Control-channel request budget.
    #[must_use]
    pub const fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    /// Client cleanup kill budget.
    #[must_use]
    pub const fn client_kill(&self) -> Duration {
        Duration::from_millis(self.client_kill_ms)
    }

    /// Shutdown sweep kill budget.
    #[must_use]
    pub const fn shutdown_kill(&self) -> Duration {
        Duration::from_millis(self.shutdown_kill_ms)
    }

    /// Shutdown sweep forced-remove budget.
    #[must_use]
    pub const fn shutdown_force_remove(&self) -> Duration {
        Duration::from_millis(self.shutdown_force_remove_ms)
    }

    /// Async sweep batch budget.
    #[must_use]
    pub const fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    /// Async sweep per-item budget.
    #[must_use]
    pub const fn batch_item_kill(&self) -> Duration {
        Duration::from_millis(self.batch_item_kill_ms)
    }
}

/// Harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Sandbox image reference.
    pub image: String,
    /// Prefix for sandbox names.
    pub name_prefix: String,
    /// Code root inside the sandbox; the host code root is mounted here.
    pub sandbox_code_root: String,
    /// Extension identifying the script argument.
    pub source_extension: String,
    /// Launch clients inside containers (false: directly on the host).
    pub use_containers: bool,
    /// Inline environment-customization script.
    pub env_script: Option<String>,
    /// File holding the environment-customization script.
    pub env_script_path: Option<PathBuf>,
    /// Timing budgets.
    pub timeouts: Timeouts,
    /// Tool servers keyed by client name.
    #[serde(
        rename = "mcpServers",
        alias = "servers",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub servers: BTreeMap<String, ClientConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            sandbox_code_root: DEFAULT_SANDBOX_CODE_ROOT.to_string(),
            source_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
            use_containers: true,
            env_script: None,
            env_script_path: None,
            timeouts: Timeouts::default(),
            servers: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Loads configuration from defaults and the environment only.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment override cannot be parsed.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        let path = path.as_ref();
        let figment = Figment::new().merge(Serialized::defaults(Self::default()));
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }

    /// Returns the environment-customization script text.
    ///
    /// `env_script_path` wins over `env_script` when both are set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the script file cannot be read.
    pub fn env_script(&self) -> Result<String> {
        if let Some(path) = &self.env_script_path {
            return std::fs::read_to_string(path).map_err(|e| {
                SandboxError::config(format!(
                    "cannot read env script {}: {e}",
                    path.display()
                ))
            });
        }
        Ok(self.env_script.clone().unwrap_or_default())
    }

    /// Looks up a server by name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no such server is configured.
    pub fn server(&self, name: &str) -> Result<&ClientConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| SandboxError::config(format!("unknown server: {name}")))
    }
}
