//! # toolprobe-sandbox
//!
//! Sandbox lifecycle management for toolprobe.
//!
//! This crate launches tool-serving processes inside disposable containers
//! (or directly on the host), drives them through a control-channel
//! handshake, keeps them under liveness monitoring and tears them down again:
//!
//! - Process-wide ledger of sandboxes with crash-safe shutdown reaping
//! - Deterministic sandbox identity and launch specification
//! - Per-client lifecycle state machine with serialized cleanup
//! - Recurring liveness probe
//! - Tool listing and invocation over the control channel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Harness                        │
//! │  ┌──────────────┐  ┌──────────┐  ┌───────────────┐  │
//! │  │ContainerReg. │  │ Launcher │  │ SandboxClient │  │
//! │  │ + signals    │  │          │  │ + Liveness    │  │
//! │  │ + ExitGuard  │  │          │  │   Monitor     │  │
//! │  └──────────────┘  └──────────┘  └───────────────┘  │
//! └─────────────────────────────────────────────────────┘
//!            │                                │
//!            ▼                                ▼
//!   ┌─────────────────┐             ┌─────────────────┐
//!   │ SandboxRuntime  │             │ ControlChannel  │
//!   │  (docker CLI)   │             │   (JSON-RPC)    │
//!   └─────────────────┘             └─────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod error;
pub mod harness;
pub mod launcher;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod signal;
pub mod state;

pub use channel::{ChannelConnector, ControlChannel, JsonRpcConnector, Tool, ToolOutput};
pub use config::{ClientConfig, HarnessConfig, Timeouts};
pub use error::{ProbeError, Result, SandboxError};
pub use harness::Harness;
pub use launcher::{LaunchSpec, Launcher, LauncherSettings};
pub use lifecycle::{LaunchMode, SandboxClient};
pub use monitor::LivenessMonitor;
pub use registry::{ContainerRegistry, ExitGuard, ReapReport, ReapTimeouts};
pub use runtime::{DockerCli, SandboxRuntime, SandboxStdio};
pub use state::{CleanupPhase, LifecycleState, SandboxStatus};
