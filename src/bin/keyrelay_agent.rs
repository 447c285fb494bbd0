//! keyrelay-agent: holds a master key in memory and serves it on loopback.
//!
//! Reads one JSON startup bundle from stdin, then serves `POST /` until its
//! timeout fires or it receives SIGTERM/SIGINT.
//!
//! ```text
//! echo '{"agent_token":"T","master_key":"azE=","timeout":30}' | keyrelay-agent 127.0.0.1:6277
//! curl --data '{"key":"T"}' http://127.0.0.1:6277/
//! ```

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use keyrelay::agent::{self, Agent};
use keyrelay::process::PidMarker;
use keyrelay::{util, Config};

#[derive(Debug, Parser)]
#[command(name = "keyrelay-agent", version, about = "In-memory master key relay")]
struct Args {
    /// Loopback address to listen on
    #[arg(default_value = "127.0.0.1:6277")]
    listen: SocketAddr,

    /// PID marker to maintain while running detached
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Append-only diagnostic log
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_file = args.log_file.clone().unwrap_or_else(|| {
        Config::from_env()
            .map(|c| c.log_file())
            .unwrap_or_else(|_| util::default_data_dir().join("agent.log"))
    });
    if let Err(e) = keyrelay::logging::init_file(&log_file, std::io::stderr().is_terminal()) {
        eprintln!("Failed to open log file {}: {}", log_file.display(), e);
    }

    let bundle = match agent::read_startup(std::io::stdin().lock()) {
        Ok(bundle) => bundle,
        Err(e) => {
            error!("{}", e);
            eprintln!("keyrelay-agent: {}", e);
            return ExitCode::from(1);
        }
    };
    info!(
        "Startup bundle accepted (timeout: {:?}, foreground: {})",
        bundle.timeout, bundle.foreground
    );

    if let Err(e) = agent::check_loopback(&args.listen) {
        error!("{}", e);
        return ExitCode::from(1);
    }

    let marker = if bundle.foreground {
        None
    } else {
        // Resolve before detach() changes the working directory.
        let marker = args.pid_file.as_deref().map(|p| PidMarker::new(absolute(p)));
        let workdir = log_file
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(absolute)
            .unwrap_or_else(|| PathBuf::from("/"));
        if let Err(e) = detach(&workdir) {
            warn!("Failed to detach from the controlling terminal: {}", e);
        }
        marker
    };
    let pid = std::process::id();
    if let Some(marker) = &marker {
        if let Err(e) = marker.write(pid) {
            error!("Failed to write pid marker {}: {}", marker.path().display(), e);
            return ExitCode::from(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };
    let result = runtime.block_on(Agent::new(bundle).run(args.listen));

    if let Some(marker) = &marker {
        if let Err(e) = marker.remove_if_owned(pid) {
            warn!("Failed to remove pid marker: {}", e);
        }
    }

    match result {
        Ok(()) => {
            info!("Agent exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Agent failed: {}", e);
            ExitCode::from(1)
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Start a new session, restrict file creation and leave the caller's cwd.
#[cfg(unix)]
fn detach(workdir: &Path) -> std::io::Result<()> {
    // A process spawned by the manager is never a group leader, so setsid
    // only fails when run by hand from an existing session leader.
    if unsafe { libc::setsid() } == -1 {
        warn!("setsid failed: {}", std::io::Error::last_os_error());
    }
    unsafe {
        libc::umask(0o077);
    }
    std::fs::create_dir_all(workdir)?;
    std::env::set_current_dir(workdir)
}

#[cfg(not(unix))]
fn detach(_workdir: &Path) -> std::io::Result<()> {
    Ok(())
}
