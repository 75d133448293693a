//! Sandbox liveness monitoring.
//!
//! A [`LivenessMonitor`] asks the runtime for a sandbox's status on a fixed
//! cadence. Only `running` is accepted. The loop ends on cancellation or on
//! the first failed probe, whichever comes first; acting on the failure is
//! left to the owner.

use crate::error::ProbeError;
use crate::runtime::SandboxRuntime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Recurring status probe for one sandbox.
pub struct LivenessMonitor {
    runtime: Arc<dyn SandboxRuntime>,
    name: String,
    interval: Duration,
    probes: AtomicU64,
}

impl LivenessMonitor {
    /// Creates a monitor for the named sandbox.
    #[must_use]
    pub fn new(runtime: Arc<dyn SandboxRuntime>, name: impl Into<String>, interval: Duration) -> Self {
        Self {
            runtime,
            name: name.into(),
            interval,
            probes: AtomicU64::new(0),
        }
    }

    /// Returns the monitored sandbox name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of probes issued so far.
    #[must_use]
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Probes the sandbox once.
    ///
    /// # Errors
    ///
    /// Returns the runtime's [`ProbeError`], or [`ProbeError::NotRunning`]
    /// for any status other than running.
    pub async fn probe_once(&self) -> Result<(), ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let status = self.runtime.inspect(&self.name).await?;
        if status.is_running() {
            debug!(sandbox = %self.name, "liveness probe passed");
            Ok(())
        } else {
            Err(ProbeError::NotRunning {
                name: self.name.clone(),
                status: status.to_string(),
            })
        }
    }

    /// Probes immediately, then once per interval, until cancelled or a
    /// probe fails.
    ///
    /// Returns `None` when cancelled and the failure otherwise.
    pub async fn watch(&self, token: CancellationToken) -> Option<ProbeError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => return None,
                outcome = self.probe_once() => outcome,
            };
            if let Err(e) = outcome {
                warn!(sandbox = %self.name, "liveness probe failed: {}", e);
                return Some(e);
            }
        }
    }

    /// Runs [`Self::watch`] on a new task.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        self.spawn_with(|_| {})
    }

    /// Runs [`Self::watch`] on a new task and hands a probe failure to
    /// `on_failure` before the task ends.
    ///
    /// `on_failure` runs on the monitor task and must not wait for it.
    #[must_use]
    pub fn spawn_with<F>(self: Arc<Self>, on_failure: F) -> MonitorHandle
    where
        F: FnOnce(&ProbeError) + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move {
            let failure = self.watch(child).await;
            if let Some(failure) = &failure {
                on_failure(failure);
            }
            failure
        });
        MonitorHandle { token, task }
    }
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("probes", &self.probe_count())
            .finish_non_exhaustive()
    }
}

/// A monitor loop running on its own task. Dropping the handle cancels
/// the loop without waiting for it.
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<Option<ProbeError>>,
}

impl MonitorHandle {
    /// Returns true once the loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end on its own.
    pub async fn join(&mut self) -> Option<ProbeError> {
        (&mut self.task).await.unwrap_or_else(|e| {
            warn!("liveness monitor task failed: {}", e);
            None
        })
    }

    /// Cancels the loop and waits until it has actually stopped.
    pub async fn stop(mut self) -> Option<ProbeError> {
        self.token.cancel();
        self.join().await
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::launcher::LaunchSpec;
    use crate::runtime::SandboxStdio;
    use crate::state::SandboxStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Runtime whose inspect walks through a scripted status list.
    struct Scripted {
        statuses: Mutex<Vec<std::result::Result<SandboxStatus, ProbeError>>>,
    }

    impl Scripted {
        fn new(mut statuses: Vec<std::result::Result<SandboxStatus, ProbeError>>) -> Arc<Self> {
            statuses.reverse();
            Arc::new(Self {
                statuses: Mutex::new(statuses),
            })
        }
    }

    #[async_trait]
    impl SandboxRuntime for Scripted {
        async fn run(&self, _spec: &LaunchSpec) -> Result<SandboxStdio> {
            unimplemented!()
        }

        async fn kill(&self, _name: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn force_remove(&self, _name: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn inspect(&self, _name: &str) -> std::result::Result<SandboxStatus, ProbeError> {
            self.statuses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(SandboxStatus::Running))
        }

        fn kill_blocking(&self, _name: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn force_remove_blocking(&self, _name: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_once_rejects_exited() {
        let runtime = Scripted::new(vec![Ok(SandboxStatus::Exited)]);
        let monitor = LivenessMonitor::new(runtime, "box", Duration::from_secs(2));

        let err = monitor.probe_once().await.unwrap_err();
        assert_eq!(
            err,
            ProbeError::NotRunning {
                name: "box".to_string(),
                status: "exited".to_string(),
            }
        );
        assert!(monitor.probe_once().await.is_ok());
        assert_eq!(monitor.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stops_on_first_failure() {
        let runtime = Scripted::new(vec![
            Ok(SandboxStatus::Running),
            Ok(SandboxStatus::Running),
            Err(ProbeError::NotFound("box".to_string())),
        ]);
        let monitor = LivenessMonitor::new(runtime, "box", Duration::from_secs(2));

        let failure = monitor.watch(CancellationToken::new()).await;
        assert_eq!(failure, Some(ProbeError::NotFound("box".to_string())));
        assert_eq!(monitor.probe_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_joins_the_loop() {
        let runtime = Scripted::new(Vec::new());
        let monitor = Arc::new(LivenessMonitor::new(runtime, "box", Duration::from_secs(2)));

        let handle = Arc::clone(&monitor).spawn();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        assert_eq!(handle.stop().await, None);
        let probes = monitor.probe_count();
        assert!(probes >= 3, "expected at least 3 probes, got {probes}");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(monitor.probe_count(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_the_loop() {
        let runtime = Scripted::new(Vec::new());
        let monitor = Arc::new(LivenessMonitor::new(runtime, "box", Duration::from_secs(2)));

        let handle = Arc::clone(&monitor).spawn();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let probes = monitor.probe_count();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(monitor.probe_count(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_with_reports_failure() {
        let runtime = Scripted::new(vec![
            Ok(SandboxStatus::Running),
            Ok(SandboxStatus::Other("dead".to_string())),
        ]);
        let monitor = Arc::new(LivenessMonitor::new(runtime, "box", Duration::from_secs(2)));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let mut handle = monitor.spawn_with(move |failure| {
            let _ = tx.send(failure.clone());
        });
        let reported = rx.await.unwrap();
        assert!(matches!(reported, ProbeError::NotRunning { ref status, .. } if status == "dead"));
        assert_eq!(handle.join().await, Some(reported));
    }
}
