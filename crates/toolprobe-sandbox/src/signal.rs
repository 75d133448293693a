//! Termination-signal supervision.
//!
//! Signals never run cleanup themselves. The supervisor task receives them
//! through tokio's signal streams, counts them on the registry and then:
//!
//! - first signal: reaps the ledger on the blocking pool and exits with 0
//! - while that reap runs: the second signal is logged, the third to fifth
//!   are warned about and the sixth forces an immediate exit

use crate::registry::ContainerRegistry;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Signals that are only logged while a shutdown sweep runs.
const QUIET_SIGNALS: u32 = 2;

/// Signal count after which the process is terminated unconditionally.
const FORCE_EXIT_AFTER: u32 = 5;

/// Exit code of a forced, non-graceful termination.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Reaction to one termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Start the shutdown sweep, then exit with 0.
    BeginShutdown,
    /// Shutdown already running; note the signal.
    Wait,
    /// Shutdown already running; warn that it is being interrupted.
    Warn,
    /// Terminate immediately.
    ForceExit,
}

/// Escalation for the `count`-th signal received while a shutdown runs.
#[must_use]
pub const fn escalation(count: u32) -> SignalAction {
    if count <= QUIET_SIGNALS {
        SignalAction::Wait
    } else if count <= FORCE_EXIT_AFTER {
        SignalAction::Warn
    } else {
        SignalAction::ForceExit
    }
}

/// Receives termination signals for the life of the process.
pub(crate) async fn supervise(registry: Arc<ContainerRegistry>) {
    let mut signals = match Signals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("failed to install signal handlers: {}", e);
            return;
        }
    };

    loop {
        let name = signals.recv().await;
        match registry.record_signal() {
            SignalAction::BeginShutdown => {
                info!(signal = name, "received termination signal, reaping sandboxes");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let sweep = tokio::task::spawn_blocking(move || registry.sweep_blocking());
                    match sweep.await {
                        Ok(report) if !report.remaining.is_empty() => {
                            warn!(remaining = ?report.remaining, "some sandboxes survived shutdown");
                        }
                        Ok(_) => {}
                        Err(e) => error!("shutdown sweep panicked: {}", e),
                    }
                    info!("exiting");
                    std::process::exit(0);
                });
            }
            SignalAction::Wait => {
                info!(
                    count = registry.signal_count(),
                    "cleanup in progress, please wait"
                );
            }
            SignalAction::Warn => {
                warn!(
                    count = registry.signal_count(),
                    "cleanup still in progress, signal again to force exit"
                );
            }
            SignalAction::ForceExit => {
                error!(
                    count = registry.signal_count(),
                    "repeated termination signals, forcing exit"
                );
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }
}

/// Interrupt and terminate streams.
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "ctrl-c"
    }
}
