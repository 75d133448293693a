//! Integration tests for the sandbox registry and its sweeps.

mod common;

use common::{KillBehavior, LogCapture, MockRuntime};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use toolprobe_sandbox::signal::SignalAction;
use toolprobe_sandbox::{ContainerRegistry, ReapTimeouts};

fn registry(runtime: &Arc<MockRuntime>) -> Arc<ContainerRegistry> {
    Arc::new(ContainerRegistry::new(
        runtime.clone(),
        ReapTimeouts::default(),
    ))
}

// ============================================================================
// Ledger
// ============================================================================

#[test]
fn test_register_unregister() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    registry.register("c1");
    registry.register("c1");
    assert_eq!(registry.len(), 1);
    assert!(registry.contains("c1"));

    registry.unregister("c1");
    assert!(!registry.contains("c1"));
    assert!(registry.is_empty());

    // Unknown names are ignored.
    registry.unregister("c1");
    assert!(registry.is_empty());
}

#[test]
fn test_concurrent_register_unregister() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let name = format!("sandbox-{worker}-{i}");
                    registry.register(&name);
                    registry.unregister(&name);
                    assert!(!registry.contains(&name));
                }
                registry.register(&format!("kept-{worker}"));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let names = registry.snapshot();
    assert_eq!(names.len(), 8);
    assert!(names.iter().all(|name| name.starts_with("kept-")));
}

#[test]
fn test_register_unique_disambiguates() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    assert_eq!(registry.register_unique("mcp-server-a-100"), "mcp-server-a-100");
    assert_eq!(registry.register_unique("mcp-server-a-100"), "mcp-server-a-100-1");
    assert_eq!(registry.register_unique("mcp-server-a-100"), "mcp-server-a-100-2");
    assert_eq!(registry.len(), 3);

    registry.unregister("mcp-server-a-100-1");
    assert_eq!(registry.register_unique("mcp-server-a-100"), "mcp-server-a-100-1");
}

// ============================================================================
// Async Sweep
// ============================================================================

#[tokio::test]
async fn test_reap_all_instant_kill() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);
    registry.register("c1");
    let (logs, _logs) = LogCapture::install();

    let report = registry.reap_all().await;

    assert!(registry.is_empty());
    assert!(report.is_clean());
    assert!(!report.timed_out);
    assert_eq!(report.reaped, vec!["c1".to_string()]);
    assert_eq!(runtime.kills(), 1);
    assert_eq!(logs.count("exceeded"), 0, "unexpected logs: {}", logs.contents());
}

#[tokio::test(start_paused = true)]
async fn test_reap_all_abandons_after_batch_timeout() {
    let runtime = MockRuntime::new();
    runtime.set_kill(KillBehavior::Never);
    let registry = registry(&runtime);
    registry.register("c2");
    let (logs, _logs) = LogCapture::install();

    let started = Instant::now();
    let report = registry.reap_all().await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(report.timed_out);
    assert_eq!(report.remaining, vec!["c2".to_string()]);
    assert!(registry.contains("c2"));
    assert_eq!(logs.count("WARN"), 1, "logs: {}", logs.contents());
    assert_eq!(logs.count("sandbox reaping exceeded"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reap_all_reports_only_its_own_kills() {
    let runtime = MockRuntime::new();
    runtime.set_kill(KillBehavior::Never);
    let registry = registry(&runtime);
    registry.register("a");

    let unregister_elsewhere = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.unregister("a");
    };
    let (report, ()) = tokio::join!(registry.reap_all(), unregister_elsewhere);

    assert!(report.timed_out);
    assert!(report.reaped.is_empty());
    assert!(report.remaining.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_kill_does_not_block_others() {
    let runtime = MockRuntime::new();
    runtime.set_kill(KillBehavior::Delay(Duration::from_secs(2)));
    let registry = registry(&runtime);
    for name in ["a", "b", "c"] {
        registry.register(name);
    }

    let started = Instant::now();
    let report = registry.reap_all().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(report.is_clean());
    assert_eq!(report.reaped.len(), 3);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reap_all_keeps_failed_kills() {
    let runtime = MockRuntime::new();
    runtime.set_kill(KillBehavior::Fail);
    let registry = registry(&runtime);
    registry.register("stuck");

    let report = registry.reap_all().await;

    assert!(!report.timed_out);
    assert_eq!(report.remaining, vec!["stuck".to_string()]);
    assert!(registry.contains("stuck"));
}

#[tokio::test]
async fn test_sweeps_are_idempotent_when_empty() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    assert!(registry.reap_all().await.is_clean());
    assert!(registry.reap_all().await.is_clean());
    assert!(registry.reap_all_blocking().is_clean());
    assert!(registry.reap_all_blocking().is_clean());

    assert_eq!(runtime.kills(), 0);
    assert_eq!(runtime.blocking_kills.load(Ordering::SeqCst), 0);
    assert!(!registry.is_shutting_down());
}

// ============================================================================
// Shutdown Sweep
// ============================================================================

#[test]
fn test_blocking_sweep_force_removes_leftovers() {
    let runtime = MockRuntime::new();
    runtime.fail_blocking_kill();
    let registry = registry(&runtime);
    registry.register("a");
    registry.register("b");

    let report = registry.reap_all_blocking();

    assert!(registry.is_empty());
    assert_eq!(report.reaped.len(), 2);
    assert_eq!(runtime.blocking_kills.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.blocking_removes.load(Ordering::SeqCst), 2);
    assert!(!registry.is_shutting_down());
}

#[test]
fn test_blocking_sweep_leaves_failures_registered() {
    let runtime = MockRuntime::new();
    runtime.fail_blocking_kill();
    runtime.fail_blocking_remove();
    let registry = registry(&runtime);
    registry.register("a");

    let report = registry.reap_all_blocking();

    assert_eq!(report.remaining, vec!["a".to_string()]);
    assert!(registry.contains("a"));
}

#[test]
fn test_exit_guard_reaps_on_drop() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);
    registry.register("a");

    {
        let _guard = registry.exit_guard();
    }

    assert!(registry.is_empty());
    assert_eq!(runtime.blocking_kills.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_guard_dropped_on_runtime_worker() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);
    registry.register("a");

    let guard = registry.exit_guard();
    let other = tokio::spawn(async {
        tokio::task::yield_now().await;
        7
    });
    drop(guard);

    assert!(registry.is_empty());
    assert_eq!(runtime.blocking_kills.load(Ordering::SeqCst), 1);
    assert_eq!(other.await.unwrap(), 7);
}

#[test]
fn test_signal_escalation() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    assert_eq!(registry.record_signal(), SignalAction::BeginShutdown);
    assert!(registry.is_shutting_down());

    let actions: Vec<_> = (0..5).map(|_| registry.record_signal()).collect();
    assert_eq!(
        actions,
        vec![
            SignalAction::Wait,
            SignalAction::Warn,
            SignalAction::Warn,
            SignalAction::Warn,
            SignalAction::ForceExit,
        ]
    );
    assert_eq!(registry.signal_count(), 6);
}

#[test]
fn test_blocking_sweep_skipped_during_shutdown() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);
    registry.register("a");

    assert_eq!(registry.record_signal(), SignalAction::BeginShutdown);
    let report = registry.reap_all_blocking();

    assert!(report.reaped.is_empty());
    assert!(registry.contains("a"));
    assert_eq!(runtime.blocking_kills.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initialize_once() {
    let runtime = MockRuntime::new();
    let registry = registry(&runtime);

    assert!(registry.initialize_once());
    assert!(!registry.initialize_once());
}
