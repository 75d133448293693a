//! Process-wide sandbox context.
//!
//! A [`Harness`] is built once at process start. It owns the single
//! [`ContainerRegistry`] of the process together with the runtime, channel
//! connector and launcher, and hands them to every [`SandboxClient`] it
//! creates.

use crate::channel::{ChannelConnector, JsonRpcConnector};
use crate::config::{ClientConfig, HarnessConfig};
use crate::error::Result;
use crate::launcher::{Launcher, LauncherSettings};
use crate::lifecycle::{ClientBackends, LaunchMode, SandboxClient};
use crate::registry::{ContainerRegistry, ExitGuard, ReapReport, ReapTimeouts};
use crate::runtime::{DockerCli, SandboxRuntime};
use std::sync::Arc;

/// Shared context for all sandbox clients of a process.
pub struct Harness {
    config: HarnessConfig,
    backends: ClientBackends,
}

impl Harness {
    /// Creates a harness driving the docker CLI and speaking JSON-RPC.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the env script cannot be read.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let runtime = DockerCli::default().with_inspect_timeout(config.timeouts.inspect());
        let cli = runtime.binary().to_string();
        Self::build(config, Arc::new(runtime), Arc::new(JsonRpcConnector::default()), cli)
    }

    /// Creates a harness with custom runtime and channel backends.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the env script cannot be read.
    pub fn with_backends(
        config: HarnessConfig,
        runtime: Arc<dyn SandboxRuntime>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<Self> {
        Self::build(config, runtime, connector, crate::runtime::DOCKER_CLI.to_string())
    }

    fn build(
        config: HarnessConfig,
        runtime: Arc<dyn SandboxRuntime>,
        connector: Arc<dyn ChannelConnector>,
        cli: String,
    ) -> Result<Self> {
        let launcher = Launcher::new(LauncherSettings::from_config(&config, cli)?);
        let registry = Arc::new(ContainerRegistry::new(
            Arc::clone(&runtime),
            ReapTimeouts::from(&config.timeouts),
        ));
        let backends = ClientBackends {
            registry,
            runtime,
            connector,
            launcher: Arc::new(launcher),
            timeouts: config.timeouts.clone(),
        };
        Ok(Self { config, backends })
    }

    /// Returns the harness configuration.
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Returns the process-wide registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.backends.registry
    }

    /// Returns the launcher.
    #[must_use]
    pub fn launcher(&self) -> &Launcher {
        &self.backends.launcher
    }

    /// Returns the launch mode for new clients.
    #[must_use]
    pub const fn mode(&self) -> LaunchMode {
        LaunchMode::from_use_containers(self.config.use_containers)
    }

    /// Installs the termination-signal supervisor once per process.
    ///
    /// Returns true if this call installed it.
    pub fn initialize_once(&self) -> bool {
        self.backends.registry.initialize_once()
    }

    /// Returns a guard that reaps every registered sandbox when dropped.
    #[must_use]
    pub fn exit_guard(&self) -> ExitGuard {
        self.backends.registry.exit_guard()
    }

    /// Creates a client for a configured server.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the server is not configured.
    pub fn client(&self, name: &str) -> Result<Arc<SandboxClient>> {
        let config = self.config.server(name)?.clone();
        Ok(self.client_with(name, config))
    }

    /// Creates a client from an explicit configuration.
    #[must_use]
    pub fn client_with(&self, name: &str, config: ClientConfig) -> Arc<SandboxClient> {
        Arc::new(SandboxClient::new(
            name,
            config,
            self.mode(),
            self.backends.clone(),
        ))
    }

    /// Kills every registered sandbox concurrently.
    pub async fn shutdown(&self) -> ReapReport {
        self.backends.registry.reap_all().await
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("mode", &self.mode())
            .field("registry", &self.backends.registry)
            .finish_non_exhaustive()
    }
}
