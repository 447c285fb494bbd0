//! Error taxonomy shared by the agent, the process manager and the store.
//!
//! Query-endpoint failures (`MalformedInput`, `AuthenticationFailure`) are
//! turned into structured error responses by the agent. Everything else
//! aborts the current operation and surfaces to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// A payload on the startup channel or the query endpoint did not parse.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid agent token")]
    AuthenticationFailure,

    /// The store URL names a backend other than sqlite.
    #[error("Storage scheme '{0}' is not supported, only sqlite is")]
    UnsupportedBackend(String),

    /// Marker names a PID that no longer exists. Reconciled by removing the marker.
    #[error("Stale agent marker for pid {0}")]
    StaleProcess(u32),

    #[error("Upstream credential expired or missing: {0}")]
    ExpiredCredential(String),

    #[error("Failed to spawn agent '{program}': {reason}")]
    SpawnFailure { program: String, reason: String },

    /// A live agent ignored the termination signal.
    #[error("Agent pid {0} is still running after termination request")]
    AgentStillRunning(u32),

    #[error("Refusing to listen on non-loopback address {0}")]
    NotLoopback(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
