//! Agent process management.
//!
//! Guarantees at most one agent per marker, replaces a running agent when a
//! new master key is set, and hands the startup bundle to the fresh process
//! over its stdin. All replacement work runs under an exclusive lock on
//! `agent.lock` so concurrent callers cannot race on the marker or the port.

mod marker;
pub mod pid;

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::relay::{AgentToken, StartupBundle};

pub use marker::{MarkerLock, PidMarker};

/// A running agent as recorded by the marker and the store's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentHandle {
    pub pid: u32,
    pub listen_port: u16,
}

/// What the marker currently says about the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    NotRunning,
    Running { pid: u32 },
    /// Marker present but its process is gone.
    Stale { pid: u32 },
}

/// A freshly spawned agent and the token it will accept.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub handle: AgentHandle,
    pub agent_token: AgentToken,
    child: Child,
}

impl SpawnedAgent {
    /// Block until the agent exits. Used when it runs in the foreground.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }
}

#[derive(Debug, Clone)]
pub struct AgentProcessManager {
    program: PathBuf,
    marker: PidMarker,
    lock_path: PathBuf,
    log_file: PathBuf,
    stop_timeout: Duration,
    foreground: bool,
}

impl AgentProcessManager {
    pub fn new(config: &Config) -> Self {
        Self {
            program: config.agent_program.clone(),
            marker: PidMarker::new(config.pid_file()),
            lock_path: config.lock_file(),
            log_file: config.log_file(),
            stop_timeout: config.stop_timeout,
            foreground: config.foreground,
        }
    }

    pub fn marker(&self) -> &PidMarker {
        &self.marker
    }

    /// Block until this manager holds the replacement lock.
    pub fn lock(&self) -> Result<MarkerLock> {
        MarkerLock::acquire(&self.lock_path)
    }

    /// Replace any running agent with a new one holding `master_key`.
    ///
    /// Returns once the startup bundle has been written to the new agent's
    /// stdin and the channel closed; it does not wait for the agent to start
    /// listening.
    pub fn ensure_fresh_agent(
        &self,
        master_key: &[u8],
        port: u16,
        timeout: Option<u64>,
    ) -> Result<SpawnedAgent> {
        let lock = self.lock()?;
        self.ensure_fresh_agent_locked(&lock, master_key, port, timeout)
    }

    /// [`ensure_fresh_agent`](Self::ensure_fresh_agent) for callers that
    /// already hold the lock and must record the new token before releasing it.
    pub fn ensure_fresh_agent_locked(
        &self,
        _lock: &MarkerLock,
        master_key: &[u8],
        port: u16,
        timeout: Option<u64>,
    ) -> Result<SpawnedAgent> {
        self.retire_existing()?;

        let agent_token = AgentToken::generate();
        let mut child = self.spawn(port)?;
        let pid = child.id();

        if let Err(e) = self.marker.write(pid) {
            error!("Failed to record agent pid {}: {}", pid, e);
            abandon(&mut child);
            return Err(e);
        }

        let bundle = StartupBundle::new(master_key, &agent_token, timeout, self.foreground);
        if let Err(e) = handoff(&mut child, &bundle) {
            error!("Failed to hand startup bundle to agent pid {}: {}", pid, e);
            abandon(&mut child);
            if let Err(e) = self.marker.remove() {
                warn!("Failed to remove agent marker: {}", e);
            }
            return Err(RelayError::SpawnFailure {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            });
        }

        info!(
            "Started agent pid {} on 127.0.0.1:{} (timeout: {:?})",
            pid, port, timeout
        );
        Ok(SpawnedAgent {
            handle: AgentHandle {
                pid,
                listen_port: port,
            },
            agent_token,
            child,
        })
    }

    /// Terminate the marked agent, if any, and clear the marker.
    ///
    /// Returns the PID that was stopped.
    pub fn stop_agent(&self) -> Result<Option<u32>> {
        let _lock = self.lock()?;
        let stopped = match self.status() {
            Ok(AgentStatus::Running { pid }) => Some(pid),
            _ => None,
        };
        self.retire_existing()?;
        Ok(stopped)
    }

    /// A live marked PID only counts as running when it is this manager's
    /// agent program; a reused PID leaves the marker stale and is never
    /// signalled.
    pub fn status(&self) -> Result<AgentStatus> {
        let Some(pid) = self.marker.read()? else {
            return Ok(AgentStatus::NotRunning);
        };
        if !pid::is_alive(pid) {
            return Ok(AgentStatus::Stale { pid });
        }
        if !pid::runs_program(pid, &self.program) {
            warn!(
                "Marked pid {} is not {}, treating the marker as stale",
                pid,
                self.program.display()
            );
            return Ok(AgentStatus::Stale { pid });
        }
        Ok(AgentStatus::Running { pid })
    }

    /// Reconcile the marker: stop a live agent, drop a stale or unreadable marker.
    fn retire_existing(&self) -> Result<()> {
        match self.status() {
            Ok(AgentStatus::NotRunning) => return Ok(()),
            Ok(AgentStatus::Running { pid }) => {
                info!("Agent pid {} already running, terminating it", pid);
                pid::terminate(pid, self.stop_timeout)?;
            }
            Ok(AgentStatus::Stale { pid }) => {
                info!("{}, removing marker", RelayError::StaleProcess(pid));
            }
            Err(RelayError::MalformedInput(reason)) => {
                warn!("Unreadable agent marker ({}), removing it", reason);
            }
            Err(e) => return Err(e),
        }
        self.marker.remove()
    }

    fn spawn(&self, port: u16) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("127.0.0.1:{}", port))
            .arg("--pid-file")
            .arg(self.marker.path())
            .arg("--log-file")
            .arg(&self.log_file)
            .stdin(Stdio::piped());
        if self.foreground {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        cmd.spawn().map_err(|e| {
            error!("Failed to spawn agent {}: {}", self.program.display(), e);
            RelayError::SpawnFailure {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Write the bundle line to the child's stdin and close it.
fn handoff(child: &mut Child, bundle: &StartupBundle) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("agent stdin was not piped"))?;
    let line = bundle.to_line()?;
    stdin.write_all(line.as_bytes())?;
    stdin.flush()?;
    Ok(())
}

fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill agent pid {}: {}", child.id(), e);
    }
    let _ = child.wait();
}
