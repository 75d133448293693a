//! Lifecycle and runtime state types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle state of one sandbox client.
///
/// `Idle` and `Ready` are stable. `Initializing` and `CleaningUp` are
/// transient and always resolve back to one of the stable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No sandbox; the client can be initialized.
    #[default]
    Idle,
    /// Launch and handshake in progress.
    Initializing,
    /// Handshake completed and the sandbox is being monitored.
    Ready,
    /// Teardown in progress.
    CleaningUp,
}

impl LifecycleState {
    /// Returns true for `Idle` and `Ready`.
    #[must_use]
    pub const fn is_stable(self) -> bool {
        matches!(self, Self::Idle | Self::Ready)
    }

    /// Returns the state name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::CleaningUp => "cleaning_up",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the most recent cleanup of a client.
///
/// Replaces a separate "in progress" flag and completion event: the value and
/// the wake-up live in the same `watch` cell, so a waiter can never read a
/// stale "not cleaning" value and then miss the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPhase {
    /// No cleanup has run yet.
    #[default]
    Idle,
    /// A teardown sequence is running.
    InProgress,
    /// The last teardown sequence finished.
    Done,
}

/// Sandbox status as reported by the runtime's inspect command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Restarting.
    Restarting,
    /// Exited.
    Exited,
    /// Being removed.
    Removing,
    /// Dead (error state).
    Dead,
    /// A status this crate does not know about.
    Other(String),
}

impl SandboxStatus {
    /// Parses a status string as printed by the runtime.
    #[must_use]
    pub fn from_status(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns whether the sandbox is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self == Self::Running
    }
}

impl FromStr for SandboxStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_status(s))
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Removing => write!(f, "removing"),
            Self::Dead => write!(f, "dead"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}
