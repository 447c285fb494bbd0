//! Tracing subscriber setup for the CLI and the agent.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "keyrelay=info,keyrelay_agent=info";

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            "keyrelay=debug,keyrelay_agent=debug,tower_http=debug".into()
        } else {
            DEFAULT_FILTER.into()
        }
    })
}

/// Log to stderr only. Used by the owner CLI.
pub fn init_stderr(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Log to an append-only file, and to stderr too when `also_stderr` is set.
///
/// The log file's directory is created if missing.
pub fn init_file(log_file: &Path, also_stderr: bool) -> std::io::Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file));
    let stderr_layer = also_stderr
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed());

    let _ = tracing_subscriber::registry()
        .with(env_filter(false))
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    Ok(())
}
