//! In-memory runtime and channel doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolprobe_sandbox::channel::{ChannelConnector, ControlChannel};
use serde_json::{json, Value};
use toolprobe_sandbox::{
    ClientConfig, Harness, HarnessConfig, LaunchSpec, ProbeError, Result, SandboxError,
    SandboxRuntime, SandboxStatus, SandboxStdio, Timeouts, Tool, ToolOutput,
};

/// How the mock runtime answers a kill.
#[derive(Debug, Clone, Copy)]
pub enum KillBehavior {
    Succeed,
    Delay(Duration),
    Never,
    Fail,
}

/// Runtime double recording every call.
pub struct MockRuntime {
    kill: Mutex<KillBehavior>,
    status: Mutex<std::result::Result<SandboxStatus, ProbeError>>,
    blocking_kill_fails: AtomicBool,
    blocking_remove_fails: AtomicBool,
    pub runs: AtomicUsize,
    pub kills: AtomicUsize,
    pub force_removes: AtomicUsize,
    pub blocking_kills: AtomicUsize,
    pub blocking_removes: AtomicUsize,
    pub launched: Mutex<Vec<LaunchSpec>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kill: Mutex::new(KillBehavior::Succeed),
            status: Mutex::new(Ok(SandboxStatus::Running)),
            blocking_kill_fails: AtomicBool::new(false),
            blocking_remove_fails: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            force_removes: AtomicUsize::new(0),
            blocking_kills: AtomicUsize::new(0),
            blocking_removes: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
        })
    }

    pub fn set_kill(&self, behavior: KillBehavior) {
        *self.kill.lock().unwrap() = behavior;
    }

    pub fn set_status(&self, status: std::result::Result<SandboxStatus, ProbeError>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn fail_blocking_kill(&self) {
        self.blocking_kill_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_blocking_remove(&self) {
        self.blocking_remove_fails.store(true, Ordering::SeqCst);
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<SandboxStdio> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push(spec.clone());
        Ok(SandboxStdio::detached(tokio::io::empty(), tokio::io::sink()))
    }

    async fn kill(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.kill.lock().unwrap();
        match behavior {
            KillBehavior::Succeed => Ok(()),
            KillBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            KillBehavior::Never => std::future::pending().await,
            KillBehavior::Fail => Err(SandboxError::runtime(format!("cannot kill {name}"))),
        }
    }

    async fn force_remove(&self, _name: &str, _timeout: Duration) -> Result<()> {
        self.force_removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect(&self, _name: &str) -> std::result::Result<SandboxStatus, ProbeError> {
        self.status.lock().unwrap().clone()
    }

    fn kill_blocking(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.blocking_kills.fetch_add(1, Ordering::SeqCst);
        if self.blocking_kill_fails.load(Ordering::SeqCst) {
            return Err(SandboxError::runtime(format!("cannot kill {name}")));
        }
        Ok(())
    }

    fn force_remove_blocking(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.blocking_removes.fetch_add(1, Ordering::SeqCst);
        if self.blocking_remove_fails.load(Ordering::SeqCst) {
            return Err(SandboxError::runtime(format!("cannot remove {name}")));
        }
        Ok(())
    }
}

/// How the mock channel answers the handshake.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeBehavior {
    Succeed,
    Fail,
    Delay(Duration),
    Never,
}

/// Connector double handing out [`MockChannel`]s.
pub struct MockConnector {
    handshake: Mutex<HandshakeBehavior>,
    tools: Mutex<Vec<Tool>>,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// Tool calls made so far.
    pub calls: Arc<AtomicUsize>,
    /// Upcoming tool calls that fail before one succeeds.
    pub failing_calls: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(HandshakeBehavior::Succeed),
            tools: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
            failing_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_handshake(&self, behavior: HandshakeBehavior) {
        *self.handshake.lock().unwrap() = behavior;
    }

    pub fn set_tools(&self, names: &[&str]) {
        *self.tools.lock().unwrap() = names
            .iter()
            .map(|name| Tool {
                name: (*name).to_string(),
                title: None,
                description: Some(format!("{name} tool")),
                input_schema: json!({"type": "object"}),
            })
            .collect();
    }

    pub fn fail_calls(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ChannelConnector for MockConnector {
    fn connect(&self, _stdio: SandboxStdio) -> Box<dyn ControlChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Box::new(MockChannel {
            handshake: *self.handshake.lock().unwrap(),
            tools: self.tools.lock().unwrap().clone(),
            closes: Arc::clone(&self.closes),
            calls: Arc::clone(&self.calls),
            failing_calls: Arc::clone(&self.failing_calls),
        })
    }
}

pub struct MockChannel {
    handshake: HandshakeBehavior,
    tools: Vec<Tool>,
    closes: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    failing_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn initialize(&mut self) -> Result<()> {
        match self.handshake {
            HandshakeBehavior::Succeed => Ok(()),
            HandshakeBehavior::Fail => Err(SandboxError::Handshake("rejected".to_string())),
            HandshakeBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            HandshakeBehavior::Never => std::future::pending().await,
        }
    }

    async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SandboxError::protocol(format!("{name} failed")));
        }
        Ok(ToolOutput {
            items: vec![json!({ "tool": name, "arguments": arguments })],
            is_error: false,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Formatted WARN-and-above log output of the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's logs into a fresh capture until the guard drops.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A project directory holding `weather/src/server.py`.
pub struct Project {
    _dir: tempfile::TempDir,
    pub script: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let script = dir.path().join("weather/src/server.py");
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "print('weather')\n").unwrap();
        Self { _dir: dir, script }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new("python", [self.script.display().to_string()])
    }
}

/// Test configuration with no stabilization delay and a fast probe.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        timeouts: Timeouts::fast(),
        ..HarnessConfig::default()
    }
}

/// Builds a harness on top of fresh doubles.
pub fn harness_with(config: HarnessConfig) -> (Harness, Arc<MockRuntime>, Arc<MockConnector>) {
    let runtime = MockRuntime::new();
    let connector = MockConnector::new();
    let harness = Harness::with_backends(config, runtime.clone(), connector.clone())
        .expect("harness construction failed");
    (harness, runtime, connector)
}

pub fn harness() -> (Harness, Arc<MockRuntime>, Arc<MockConnector>) {
    harness_with(test_config())
}
