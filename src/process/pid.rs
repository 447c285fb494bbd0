//! Liveness checks and termination for agent PIDs.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::error::{RelayError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether `pid` names a running (non-zombie) process.
///
/// Exited children of the current process are reaped first so they do not
/// linger as zombies.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    reap(pid);

    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Whether `pid` is an instance of `program`, matched on the executable's
/// file name or the process name the kernel reports.
///
/// Linux truncates process names to 15 bytes, so a name that long only has
/// to be a prefix of the program's file name.
pub fn runs_program(pid: u32, program: &Path) -> bool {
    let Some(expected) = program.file_name() else {
        return false;
    };
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let Some(process) = sys.process(target) else {
        return false;
    };

    if process.exe().and_then(Path::file_name) == Some(expected) {
        return true;
    }
    let name = process.name();
    let matches = name == expected || is_truncated_prefix(name, expected);
    if !matches {
        debug!("pid {} runs {:?}, expected {:?}", pid, name, expected);
    }
    matches
}

const COMM_LEN: usize = 15;

fn is_truncated_prefix(name: &OsStr, expected: &OsStr) -> bool {
    let name = name.as_encoded_bytes();
    name.len() == COMM_LEN && expected.as_encoded_bytes().starts_with(name)
}

#[cfg(unix)]
fn reap(pid: u32) {
    let mut status: libc::c_int = 0;
    // ECHILD for processes that are not ours; nothing to do then.
    unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG);
    }
}

#[cfg(not(unix))]
fn reap(_pid: u32) {}

/// Send SIGTERM to `pid` and wait up to `timeout` for it to exit.
///
/// # Errors
///
/// `AgentStillRunning` if the signal cannot be delivered or the process
/// outlives the timeout.
#[cfg(unix)]
pub fn terminate(pid: u32, timeout: Duration) -> Result<()> {
    if !is_alive(pid) {
        return Ok(());
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        tracing::error!("Failed to signal agent pid {}: {}", pid, err);
        return Err(RelayError::AgentStillRunning(pid));
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            tracing::info!("Agent pid {} exited", pid);
            return Ok(());
        }
        if Instant::now() >= deadline {
            tracing::error!("Agent pid {} ignored SIGTERM for {:?}", pid, timeout);
            return Err(RelayError::AgentStillRunning(pid));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32, _timeout: Duration) -> Result<()> {
    if is_alive(pid) {
        Err(RelayError::AgentStillRunning(pid))
    } else {
        Ok(())
    }
}
