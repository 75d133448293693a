//! Process-wide sandbox ledger.
//!
//! The registry records every sandbox this process is responsible for. An
//! entry means "try to kill this on shutdown", not "this is running": names
//! are registered before the spawn is attempted and unregistered only after
//! a confirmed kill.
//!
//! Two sweeps reclaim the ledger:
//!
//! - [`ContainerRegistry::reap_all`]: async, fans out one kill per entry under
//!   a single batch budget. Serialized by a sweep lock.
//! - [`ContainerRegistry::reap_all_blocking`]: sequential kill pass followed
//!   by a forced-remove pass for the leftovers. Used on the shutdown path
//!   (signal supervisor and [`ExitGuard`]).

use crate::config::Timeouts;
use crate::runtime::SandboxRuntime;
use crate::signal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, error, info, warn};

/// Time budgets used when reaping the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapTimeouts {
    /// Per-item kill on the shutdown sweep.
    pub kill: Duration,
    /// Per-item forced remove on the shutdown sweep.
    pub force_remove: Duration,
    /// Whole-batch budget of the async sweep.
    pub batch: Duration,
    /// Per-item kill on the async sweep.
    pub batch_item_kill: Duration,
}

impl Default for ReapTimeouts {
    fn default() -> Self {
        Self::from(&Timeouts::default())
    }
}

impl From<&Timeouts> for ReapTimeouts {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            kill: timeouts.shutdown_kill(),
            force_remove: timeouts.shutdown_force_remove(),
            batch: timeouts.batch(),
            batch_item_kill: timeouts.batch_item_kill(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sandboxes killed and unregistered.
    pub reaped: Vec<String>,
    /// Sandboxes still registered after the sweep.
    pub remaining: Vec<String>,
    /// The async sweep ran out of its batch budget.
    pub timed_out: bool,
}

impl ReapReport {
    /// Returns true if every targeted sandbox was reaped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty() && !self.timed_out
    }
}

/// Process-wide ledger of sandboxes.
///
/// Construct one per process and share it by `Arc`.
pub struct ContainerRegistry {
    ledger: Mutex<BTreeSet<String>>,
    /// Prevents overlapping async sweeps.
    sweep_lock: tokio::sync::Mutex<()>,
    /// Set once the shutdown sweep has started.
    shutdown_in_progress: AtomicBool,
    /// Termination signals received so far.
    signal_count: AtomicU32,
    /// Signal supervisor installed.
    hooks_installed: AtomicBool,
    runtime: Arc<dyn SandboxRuntime>,
    timeouts: ReapTimeouts,
}

impl ContainerRegistry {
    /// Creates an empty registry reaping through `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<dyn SandboxRuntime>, timeouts: ReapTimeouts) -> Self {
        Self {
            ledger: Mutex::new(BTreeSet::new()),
            sweep_lock: tokio::sync::Mutex::new(()),
            shutdown_in_progress: AtomicBool::new(false),
            signal_count: AtomicU32::new(0),
            hooks_installed: AtomicBool::new(false),
            runtime,
            timeouts,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sandbox name.
    pub fn register(&self, name: &str) {
        self.ledger().insert(name.to_string());
        debug!(sandbox = %name, "registered sandbox");
    }

    /// Records `base`, or `base-N` for the smallest free `N` if `base` is
    /// already taken, and returns the recorded name.
    pub fn register_unique(&self, base: &str) -> String {
        let mut ledger = self.ledger();
        let name = if ledger.contains(base) {
            (1u32..)
                .map(|n| format!("{base}-{n}"))
                .find(|candidate| !ledger.contains(candidate))
                .unwrap_or_else(|| base.to_string())
        } else {
            base.to_string()
        };
        if name != base {
            warn!(sandbox = %name, "sandbox name {base} already registered, disambiguating");
        }
        ledger.insert(name.clone());
        debug!(sandbox = %name, "registered sandbox");
        name
    }

    /// Forgets a sandbox name.
    pub fn unregister(&self, name: &str) {
        self.ledger().remove(name);
        debug!(sandbox = %name, "unregistered sandbox");
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.ledger().contains(name)
    }

    /// Returns the registered names in sorted order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.ledger().iter().cloned().collect()
    }

    /// Returns the number of registered sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledger().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ledger().is_empty()
    }

    /// Returns the number of termination signals received.
    #[must_use]
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Returns true once the shutdown sweep has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    /// Installs the termination-signal supervisor.
    ///
    /// Idempotent: only the first call on a registry spawns the supervisor.
    /// Must be called from within a tokio runtime. Returns true if this call
    /// installed it.
    pub fn initialize_once(self: &Arc<Self>) -> bool {
        if self.hooks_installed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; termination signals will not trigger cleanup");
            self.hooks_installed.store(false, Ordering::SeqCst);
            return false;
        };
        handle.spawn(signal::supervise(Arc::clone(self)));
        info!("sandbox registry initialized");
        true
    }

    /// Returns a guard that reaps the ledger when dropped.
    #[must_use]
    pub fn exit_guard(self: &Arc<Self>) -> ExitGuard {
        ExitGuard {
            registry: Arc::clone(self),
        }
    }

    /// Counts a termination signal and decides how to react.
    ///
    /// Claims the shutdown sweep when the returned action is
    /// [`signal::SignalAction::BeginShutdown`]; the caller must then run
    /// [`Self::sweep_blocking`] and exit.
    pub fn record_signal(&self) -> signal::SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.begin_shutdown() {
            return signal::SignalAction::BeginShutdown;
        }
        signal::escalation(count)
    }

    /// Claims the shutdown sweep. Returns false if it was already claimed.
    fn begin_shutdown(&self) -> bool {
        self.shutdown_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reaps every registered sandbox, blocking the calling thread.
    ///
    /// Returns an empty report without doing anything if a shutdown sweep is
    /// already running. Never fails; errors are logged and the affected
    /// names stay registered.
    pub fn reap_all_blocking(&self) -> ReapReport {
        if self.is_empty() || !self.begin_shutdown() {
            return ReapReport::default();
        }
        let report = self.sweep_blocking();
        self.shutdown_in_progress.store(false, Ordering::SeqCst);
        report
    }

    /// Kill pass, then forced-remove pass over what the kill pass left.
    pub(crate) fn sweep_blocking(&self) -> ReapReport {
        let targets = self.snapshot();
        if targets.is_empty() {
            return ReapReport::default();
        }
        info!(count = targets.len(), "reaping registered sandboxes");

        let mut reaped = Vec::new();
        let mut leftovers = Vec::new();
        for name in targets {
            match self.runtime.kill_blocking(&name, self.timeouts.kill) {
                Ok(()) => {
                    info!(sandbox = %name, "sandbox killed");
                    self.unregister(&name);
                    reaped.push(name);
                }
                Err(e) => {
                    warn!(sandbox = %name, "failed to kill sandbox: {}", e);
                    leftovers.push(name);
                }
            }
        }

        let mut remaining = Vec::new();
        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "force-removing remaining sandboxes");
        }
        for name in leftovers {
            match self
                .runtime
                .force_remove_blocking(&name, self.timeouts.force_remove)
            {
                Ok(()) => {
                    info!(sandbox = %name, "sandbox force-removed");
                    self.unregister(&name);
                    reaped.push(name);
                }
                Err(e) => {
                    error!(sandbox = %name, "failed to force-remove sandbox: {}", e);
                    remaining.push(name);
                }
            }
        }

        info!(
            reaped = reaped.len(),
            remaining = remaining.len(),
            "sandbox reaping finished"
        );
        ReapReport {
            reaped,
            remaining,
            timed_out: false,
        }
    }

    /// Kills every registered sandbox concurrently.
    ///
    /// Bounded by the batch budget as a whole: a slow kill does not hold up
    /// the others, but once the budget is spent the sweep returns and
    /// unfinished names stay registered. Successful kills are unregistered
    /// as they complete. Overlapping calls are serialized.
    ///
    /// `reaped` lists only the names this sweep killed; a name unregistered
    /// elsewhere meanwhile appears in neither list.
    pub async fn reap_all(&self) -> ReapReport {
        let _sweep = self.sweep_lock.lock().await;

        let targets = self.snapshot();
        if targets.is_empty() {
            return ReapReport::default();
        }
        debug!(count = targets.len(), "reaping registered sandboxes concurrently");

        let killed = Mutex::new(Vec::new());
        let kills = targets.iter().map(|name| {
            let killed = &killed;
            async move {
                match self
                    .runtime
                    .kill(name, self.timeouts.batch_item_kill)
                    .await
                {
                    Ok(()) => {
                        info!(sandbox = %name, "sandbox killed");
                        self.unregister(name);
                        killed
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(name.clone());
                    }
                    Err(e) => {
                        error!(sandbox = %name, "failed to kill sandbox: {}", e);
                    }
                }
            }
        });

        let timed_out = tokio::time::timeout(self.timeouts.batch, futures::future::join_all(kills))
            .await
            .is_err();

        let mut reaped = killed.into_inner().unwrap_or_else(PoisonError::into_inner);
        reaped.sort();
        let remaining = targets
            .into_iter()
            .filter(|name| !reaped.contains(name) && self.contains(name))
            .collect::<Vec<_>>();
        if timed_out {
            warn!(
                remaining = remaining.len(),
                "sandbox reaping exceeded {:?}, leaving unfinished sandboxes registered",
                self.timeouts.batch
            );
        }
        ReapReport {
            reaped,
            remaining,
            timed_out,
        }
    }
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("ledger", &*self.ledger())
            .field("shutdown_in_progress", &self.is_shutting_down())
            .field("signal_count", &self.signal_count())
            .finish_non_exhaustive()
    }
}

/// Reaps the registry when dropped.
///
/// Hold one for the lifetime of `main` so sandboxes are reclaimed on every
/// exit path that unwinds, including panics. Dropped on a multi-threaded
/// tokio worker, the blocking sweep runs via `block_in_place` so the other
/// tasks keep being scheduled.
#[must_use = "the ledger is reaped when the guard is dropped"]
pub struct ExitGuard {
    registry: Arc<ContainerRegistry>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let registry = &self.registry;
        let report = match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| registry.reap_all_blocking())
            }
            _ => registry.reap_all_blocking(),
        };
        if !report.remaining.is_empty() {
            error!(
                remaining = ?report.remaining,
                "sandboxes could not be reclaimed at exit"
            );
        }
    }
}
