//! Error types for sandbox operations.

use thiserror::Error;

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while launching, probing or tearing down a sandbox.
///
/// The variants line up with the sub-steps of `SandboxClient::initialize`:
/// resolution failures surface as [`SandboxError::Config`], process start
/// failures as [`SandboxError::Spawn`], control-channel failures as
/// [`SandboxError::Handshake`] and liveness failures as
/// [`SandboxError::Unavailable`].
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Configuration error (unresolvable entry point, missing command).
    #[error("configuration error: {0}")]
    Config(String),

    /// The sandbox process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The control-channel handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The sandbox runtime reported the sandbox as unusable.
    #[error("runtime unavailable: {0}")]
    Unavailable(#[from] ProbeError),

    /// A request on an established control channel failed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A runtime command reported failure.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new runtime error.
    #[must_use]
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new protocol error.
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the runtime reported the sandbox as unusable.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Why a liveness probe rejected a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The runtime has no sandbox with this name.
    #[error("sandbox {0} does not exist")]
    NotFound(String),

    /// The sandbox exists but is not running.
    #[error("sandbox {name} is not running (status: {status})")]
    NotRunning {
        /// Sandbox name.
        name: String,
        /// Status reported by the runtime.
        status: String,
    },

    /// The runtime itself could not be queried.
    #[error("runtime transport error: {0}")]
    Transport(String),
}
