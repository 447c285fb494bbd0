//! Configuration management for keyrelay.
//!
//! Configuration can be set via environment variables:
//! - `KEYRELAY_DATA_DIR` - Optional. Writable directory for the PID marker, lock and log.
//!   Defaults to `$XDG_DATA_HOME/keyrelay` or `~/.local/share/keyrelay`.
//! - `KEYRELAY_DB_URL` - Optional. Secret store URL. Defaults to `sqlite://<data_dir>/keyrelay.db`.
//! - `KEYRELAY_AGENT_BIN` - Optional. Agent program. Defaults to `keyrelay-agent` next to
//!   the current executable, or on `$PATH`.
//! - `KEYRELAY_STOP_TIMEOUT_SECS` - Optional. Wait for a superseded agent to exit. Defaults to `5`.
//! - `KEYRELAY_FOREGROUND` - Optional. Keep the agent attached to the terminal. Defaults to `false`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::util;

/// Default agent program name.
pub const AGENT_PROGRAM: &str = "keyrelay-agent";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Process-level configuration shared by the CLI and the agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application-local writable directory
    pub data_dir: PathBuf,

    /// Secret store URL (only `sqlite://` is supported)
    pub db_url: String,

    /// Program spawned as the agent
    pub agent_program: PathBuf,

    /// How long to wait for a superseded agent to exit after SIGTERM
    pub stop_timeout: Duration,

    /// Run the agent attached to the controlling terminal
    pub foreground: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("KEYRELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| util::default_data_dir());

        let db_url = std::env::var("KEYRELAY_DB_URL")
            .unwrap_or_else(|_| format!("sqlite://{}", data_dir.join("keyrelay.db").display()));

        let agent_program = std::env::var("KEYRELAY_AGENT_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_agent_program());

        let stop_timeout = std::env::var("KEYRELAY_STOP_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| {
                ConfigError::InvalidValue("KEYRELAY_STOP_TIMEOUT_SECS".to_string(), e.to_string())
            })?;

        let foreground = util::env_var_bool("KEYRELAY_FOREGROUND", false);

        Ok(Self {
            data_dir,
            db_url,
            agent_program,
            stop_timeout,
            foreground,
        })
    }

    /// Create a config rooted at `data_dir` (useful for testing).
    pub fn new(data_dir: PathBuf, agent_program: PathBuf) -> Self {
        Self {
            db_url: format!("sqlite://{}", data_dir.join("keyrelay.db").display()),
            data_dir,
            agent_program,
            stop_timeout: Duration::from_secs(5),
            foreground: false,
        }
    }

    /// PID marker of the running agent.
    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }

    /// Lock file serializing agent replacement.
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("agent.lock")
    }

    /// Agent diagnostic log.
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("agent.log")
    }
}

/// `keyrelay-agent` installed alongside the current executable, else a bare
/// name resolved through `$PATH` at spawn time.
fn default_agent_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(AGENT_PROGRAM)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(AGENT_PROGRAM))
}
