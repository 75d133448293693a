//! Per-client sandbox lifecycle.
//!
//! ```text
//!            initialize()                 handshake ok
//!   Idle ───────────────▶ Initializing ───────────────▶ Ready
//!    ▲                        │ failure                   │ cleanup() or
//!    │                        ▼                           │ probe failure
//!    └──────────────────── CleaningUp ◀───────────────────┘
//! ```
//!
//! A [`SandboxClient`] owns at most one sandbox at a time. Initialization
//! registers the sandbox name before spawning, races the control-channel
//! handshake against the liveness probe and tears everything down again
//! on any failure. Cleanup is serialized per client: concurrent callers
//! wait for the teardown already in flight instead of running another,
//! and a cleanup that begins while the client is initializing cancels the
//! launch instead of waiting for it.

use crate::channel::{ChannelConnector, ControlChannel, Tool, ToolOutput};
use crate::config::{ClientConfig, Timeouts};
use crate::error::{ProbeError, Result, SandboxError};
use crate::launcher::{LaunchSpec, Launcher};
use crate::monitor::{LivenessMonitor, MonitorHandle};
use crate::registry::ContainerRegistry;
use crate::runtime::SandboxRuntime;
use crate::state::{CleanupPhase, LifecycleState};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Launch Mode
// =============================================================================

/// Where a client's process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Inside a disposable container, registered and probed.
    #[default]
    Container,
    /// Directly on the host.
    Host,
}

impl LaunchMode {
    /// Returns the mode matching the `use_containers` setting.
    #[must_use]
    pub const fn from_use_containers(use_containers: bool) -> Self {
        if use_containers {
            Self::Container
        } else {
            Self::Host
        }
    }
}

/// Shared collaborators of every client in a process.
#[derive(Clone)]
pub(crate) struct ClientBackends {
    pub(crate) registry: Arc<ContainerRegistry>,
    pub(crate) runtime: Arc<dyn SandboxRuntime>,
    pub(crate) connector: Arc<dyn ChannelConnector>,
    pub(crate) launcher: Arc<Launcher>,
    pub(crate) timeouts: Timeouts,
}

// =============================================================================
// Sandbox Handle
// =============================================================================

/// Everything tied to one running sandbox.
#[derive(Default)]
struct SandboxHandle {
    /// Registered sandbox name (container mode only).
    sandbox: Option<String>,
    /// Launch specification the sandbox was started from.
    spec: Option<LaunchSpec>,
    /// Control channel over the sandbox's stdio.
    channel: Option<Box<dyn ControlChannel>>,
    /// Steady-state liveness monitor.
    monitor: Option<MonitorHandle>,
}

// =============================================================================
// Sandbox Client
// =============================================================================

/// Lifecycle state machine of one tool-server client.
pub struct SandboxClient {
    name: String,
    config: ClientConfig,
    mode: LaunchMode,
    backends: ClientBackends,
    state: watch::Sender<LifecycleState>,
    cleanup: watch::Sender<CleanupPhase>,
    /// Serializes access to the running sandbox.
    handle: tokio::sync::Mutex<Option<SandboxHandle>>,
    identity: Mutex<Option<String>>,
    /// Cancels the launch in flight; set while initializing.
    pending_launch: Mutex<Option<CancellationToken>>,
    last_probe_failure: Mutex<Option<ProbeError>>,
}

impl SandboxClient {
    pub(crate) fn new(
        name: impl Into<String>,
        config: ClientConfig,
        mode: LaunchMode,
        backends: ClientBackends,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            mode,
            backends,
            state: watch::Sender::new(LifecycleState::Idle),
            cleanup: watch::Sender::new(CleanupPhase::Idle),
            handle: tokio::sync::Mutex::new(None),
            identity: Mutex::new(None),
            pending_launch: Mutex::new(None),
            last_probe_failure: Mutex::new(None),
        }
    }

    /// Returns the client name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the launch mode.
    #[must_use]
    pub const fn mode(&self) -> LaunchMode {
        self.mode
    }

    /// Returns the client's launch configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Returns true if the client is ready for use.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Returns true if the client is idle and no cleanup is in flight.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.state() == LifecycleState::Idle && *self.cleanup.borrow() != CleanupPhase::InProgress
    }

    /// Returns the name of the current sandbox, if one is registered.
    #[must_use]
    pub fn sandbox_name(&self) -> Option<String> {
        lock(&self.identity).clone()
    }

    /// Returns the launch specification of the running sandbox.
    ///
    /// Waits while an initialization or teardown holds the sandbox.
    pub async fn launch_spec(&self) -> Option<LaunchSpec> {
        self.handle
            .lock()
            .await
            .as_ref()
            .and_then(|handle| handle.spec.clone())
    }

    /// Returns the probe failure that ended the last session, if any.
    #[must_use]
    pub fn last_probe_failure(&self) -> Option<ProbeError> {
        lock(&self.last_probe_failure).clone()
    }

    /// Launches the sandbox and completes the control-channel handshake.
    ///
    /// Does nothing if the client is already ready. On failure the sandbox
    /// is torn down before the error is returned, leaving the client
    /// reusable.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::InvalidState`] if the client is initializing or
    ///   cleaning up
    /// - [`SandboxError::Config`] if the entry point cannot be resolved
    /// - [`SandboxError::Spawn`] if the sandbox cannot be started
    /// - [`SandboxError::Handshake`] or [`SandboxError::Timeout`] if the
    ///   handshake fails
    /// - [`SandboxError::Unavailable`] if the liveness probe rejects the
    ///   sandbox first
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut current = LifecycleState::Idle;
        let reusable = self.is_reusable();
        let cancel = CancellationToken::new();
        let claimed = self.state.send_if_modified(|state| {
            current = *state;
            if *state == LifecycleState::Idle && reusable {
                *state = LifecycleState::Initializing;
                *lock(&self.pending_launch) = Some(cancel.clone());
                true
            } else {
                false
            }
        });

        if !claimed {
            if current == LifecycleState::Ready {
                warn!(client = %self.name, "client already initialized");
                return Ok(());
            }
            return Err(SandboxError::invalid_state(format!(
                "client {} is {}",
                self.name,
                if current == LifecycleState::Idle {
                    LifecycleState::CleaningUp
                } else {
                    current
                }
            )));
        }

        *lock(&self.last_probe_failure) = None;
        info!(client = %self.name, mode = ?self.mode, "initializing client");

        let outcome = self.start(&cancel).await;
        lock(&self.pending_launch).take();
        match outcome {
            Ok(()) => {
                info!(client = %self.name, sandbox = ?self.sandbox_name(), "client ready");
                Ok(())
            }
            Err(e) => {
                warn!(client = %self.name, "initialization failed: {}", e);
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let mut slot = self.handle.lock().await;
        let handle = slot.insert(SandboxHandle::default());

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(SandboxError::invalid_state(format!(
                    "client {} was cleaned up during initialization",
                    self.name
                )));
            }
            launched = self.launch(handle) => launched?,
        }

        let promoted = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Initializing {
                *state = LifecycleState::Ready;
                true
            } else {
                false
            }
        });
        if promoted {
            return Ok(());
        }
        match self.last_probe_failure() {
            Some(failure) => Err(failure.into()),
            None => Err(SandboxError::invalid_state(format!(
                "client {} was cleaned up during initialization",
                self.name
            ))),
        }
    }

    /// Spawns the sandbox and completes the handshake, recording every
    /// acquired resource in `handle` as it goes.
    async fn launch(self: &Arc<Self>, handle: &mut SandboxHandle) -> Result<()> {
        let backends = &self.backends;

        let spec = match self.mode {
            LaunchMode::Container => {
                let entry = backends.launcher.resolve(&self.config)?;
                let base = backends
                    .launcher
                    .sandbox_name(&self.name, chrono::Utc::now().timestamp());
                let sandbox = backends.registry.register_unique(&base);
                *lock(&self.identity) = Some(sandbox.clone());
                handle.sandbox = Some(sandbox.clone());

                let spec = backends.launcher.container_spec(&sandbox, &entry, &self.config);
                debug!(client = %self.name, command = %spec.command_line(), "launch specification");

                if let Err(e) = backends
                    .runtime
                    .force_remove(&sandbox, backends.timeouts.shutdown_force_remove())
                    .await
                {
                    debug!(sandbox = %sandbox, "no stale sandbox removed: {}", e);
                }
                spec
            }
            LaunchMode::Host => backends.launcher.host_spec(&self.config)?,
        };

        let stdio = backends.runtime.run(&spec).await?;
        handle.spec = Some(spec);
        let channel = handle.channel.insert(backends.connector.connect(stdio));

        match handle.sandbox.clone() {
            Some(sandbox) => {
                tokio::time::sleep(backends.timeouts.stabilization()).await;
                self.handshake_with_probe(&sandbox, channel.as_mut()).await?;
                handle.monitor = Some(self.spawn_monitor(&sandbox));
            }
            None => self.handshake(channel.as_mut()).await?,
        }
        Ok(())
    }

    async fn handshake(&self, channel: &mut dyn ControlChannel) -> Result<()> {
        let limit = self.backends.timeouts.handshake();
        tokio::time::timeout(limit, channel.initialize())
            .await
            .map_err(|_| SandboxError::timeout(format!("handshake exceeded {limit:?}")))?
    }

    /// Races the handshake against the liveness probe. The loser is
    /// cancelled and joined before returning.
    async fn handshake_with_probe(&self, sandbox: &str, channel: &mut dyn ControlChannel) -> Result<()> {
        let monitor = LivenessMonitor::new(
            Arc::clone(&self.backends.runtime),
            sandbox,
            self.backends.timeouts.probe_interval(),
        );
        let mut probe = Arc::new(monitor).spawn();

        tokio::select! {
            outcome = self.handshake(channel) => {
                if let Some(failure) = probe.stop().await {
                    debug!(sandbox = %sandbox, "probe failed as the handshake finished: {}", failure);
                }
                outcome
            }
            failure = probe.join() => match failure {
                Some(failure) => {
                    *lock(&self.last_probe_failure) = Some(failure.clone());
                    Err(failure.into())
                }
                None => Err(SandboxError::Handshake(
                    "liveness probe ended before the handshake".to_string(),
                )),
            },
        }
    }

    /// Starts the steady-state monitor. A probe failure schedules teardown
    /// on a separate task so the monitor never waits on itself.
    fn spawn_monitor(self: &Arc<Self>, sandbox: &str) -> MonitorHandle {
        let monitor = LivenessMonitor::new(
            Arc::clone(&self.backends.runtime),
            sandbox,
            self.backends.timeouts.probe_interval(),
        );
        let client = Arc::downgrade(self);
        Arc::new(monitor).spawn_with(move |failure| {
            let Some(client) = client.upgrade() else {
                return;
            };
            warn!(client = %client.name, "sandbox became unavailable, tearing down: {}", failure);
            *lock(&client.last_probe_failure) = Some(failure.clone());
            tokio::spawn(async move { client.cleanup().await });
        })
    }

    // =========================================================================
    // Tools
    // =========================================================================

    /// Lists the tools offered by the server.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidState`] if the client is not ready, or
    /// the channel's error if the request fails.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut slot = self.handle.lock().await;
        let channel = self.ready_channel(&mut slot)?;
        self.bounded("tools/list", channel.list_tools()).await
    }

    /// Calls a tool once.
    ///
    /// # Errors
    ///
    /// See [`Self::call_tool_with_retries`].
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        self.call_tool_with_retries(tool, arguments, 1, Duration::from_secs(1))
            .await
    }

    /// Calls a tool, retrying failed attempts after `delay`.
    ///
    /// The sandbox is released between attempts, so a cleanup issued while
    /// retrying is not held up.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidState`] if the client is not ready, or
    /// the last attempt's error once `attempts` are used up.
    pub async fn call_tool_with_retries(
        &self,
        tool: &str,
        arguments: Value,
        attempts: u32,
        delay: Duration,
    ) -> Result<ToolOutput> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(client = %self.name, tool, "executing tool");
            let outcome = {
                let mut slot = self.handle.lock().await;
                let channel = self.ready_channel(&mut slot)?;
                self.bounded("tools/call", channel.call_tool(tool, arguments.clone()))
                    .await
            };
            match outcome {
                Ok(output) => return Ok(output),
                Err(e) if attempt < attempts => {
                    warn!(client = %self.name, tool, "tool call failed: {}; attempt {} of {}", e, attempt, attempts);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(client = %self.name, tool, "tool call failed after {} attempts: {}", attempts, e);
                    return Err(e);
                }
            }
        }
    }

    fn ready_channel<'a>(
        &self,
        slot: &'a mut Option<SandboxHandle>,
    ) -> Result<&'a mut Box<dyn ControlChannel>> {
        if !self.is_ready() {
            return Err(SandboxError::invalid_state(format!(
                "client {} is {}",
                self.name,
                self.state()
            )));
        }
        slot.as_mut()
            .and_then(|handle| handle.channel.as_mut())
            .ok_or_else(|| {
                SandboxError::invalid_state(format!("client {} has no control channel", self.name))
            })
    }

    /// Applies the request budget to a channel call.
    async fn bounded<T>(
        &self,
        method: &str,
        call: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let limit = self.backends.timeouts.request();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| SandboxError::timeout(format!("{method} exceeded {limit:?}")))?
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Tears down the current sandbox and returns the client to idle.
    ///
    /// Never fails; each step logs its error and the next one runs. If a
    /// teardown is already running, waits for it to finish instead.
    pub async fn cleanup(&self) {
        let claimed = self.cleanup.send_if_modified(|phase| {
            if *phase == CleanupPhase::InProgress {
                false
            } else {
                *phase = CleanupPhase::InProgress;
                true
            }
        });
        if !claimed {
            debug!(client = %self.name, "cleanup already in progress, waiting");
            let mut phase = self.cleanup.subscribe();
            let _ = phase.wait_for(|phase| *phase != CleanupPhase::InProgress).await;
            return;
        }

        let _completion = Completion { client: self };
        self.state.send_replace(LifecycleState::CleaningUp);
        if let Some(launch) = lock(&self.pending_launch).take() {
            debug!(client = %self.name, "cancelling initialization in flight");
            launch.cancel();
        }
        debug!(client = %self.name, "cleaning up");

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            self.teardown(handle).await;
        }
    }

    async fn teardown(&self, mut handle: SandboxHandle) {
        if let Some(monitor) = handle.monitor.take() {
            if let Some(failure) = monitor.stop().await {
                debug!(client = %self.name, "monitor ended with: {}", failure);
            }
        }

        if let Some(sandbox) = handle.sandbox.as_deref() {
            let limit = self.backends.timeouts.client_kill();
            match tokio::time::timeout(limit, self.backends.runtime.kill(sandbox, limit)).await {
                Ok(Ok(())) => {
                    info!(sandbox = %sandbox, "sandbox killed");
                    self.backends.registry.unregister(sandbox);
                }
                Ok(Err(e)) => {
                    warn!(sandbox = %sandbox, "failed to kill sandbox, leaving it registered: {}", e);
                }
                Err(_) => {
                    warn!(sandbox = %sandbox, "killing sandbox exceeded {:?}, leaving it registered", limit);
                }
            }
        }

        if let Some(mut channel) = handle.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(client = %self.name, "failed to close control channel: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SandboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxClient")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("sandbox", &self.sandbox_name())
            .finish_non_exhaustive()
    }
}

/// Ends a cleanup on every exit path: the client becomes idle and waiters
/// are released, in that order.
struct Completion<'a> {
    client: &'a SandboxClient,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        *lock(&self.client.identity) = None;
        self.client.state.send_replace(LifecycleState::Idle);
        self.client.cleanup.send_replace(CleanupPhase::Done);
        debug!(client = %self.client.name, "cleanup complete");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
