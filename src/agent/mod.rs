//! The agent process: holds the decrypted master key in memory and releases
//! it to callers presenting the matching agent token.
//!
//! ## Lifecycle
//!
//! ```text
//!   Starting ──bundle accepted──▶ Serving ──timeout / SIGTERM / SIGINT──▶ Terminating
//!      │
//!      └── malformed or incomplete bundle: exit 1
//! ```
//!
//! The timeout is the only automatic exit path. When it fires the listener
//! stops accepting immediately; in-flight requests get [`DRAIN_GRACE`] to
//! finish before the process exits.

mod routes;

use std::future::IntoFuture;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{RelayError, Result};
use crate::relay::{AcceptedBundle, AgentToken, StartupBundle};

pub use routes::router;

/// Time in-flight requests get after shutdown begins.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Starting,
    Serving,
    Terminating,
}

/// Secret material owned by the serving loop and shared with request handlers.
pub struct AgentState {
    pub agent_token: AgentToken,
    pub master_key: Zeroizing<Vec<u8>>,
}

/// Read exactly one startup line from `input` and validate it.
pub fn read_startup<R: BufRead>(mut input: R) -> Result<AcceptedBundle> {
    let mut line = Zeroizing::new(String::new());
    let read = input.read_line(&mut line)?;
    if read == 0 {
        return Err(RelayError::MalformedInput(
            "stdin closed before a startup bundle arrived".to_string(),
        ));
    }
    StartupBundle::parse(&line)
}

/// Only loopback listeners are allowed; the loopback boundary is the
/// endpoint's sole transport isolation.
pub fn check_loopback(addr: &SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err(RelayError::NotLoopback(addr.to_string()))
    }
}

pub struct Agent {
    state: Arc<AgentState>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    phase: watch::Sender<AgentPhase>,
}

impl Agent {
    pub fn new(bundle: AcceptedBundle) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Starting);
        Self {
            state: Arc::new(AgentState {
                agent_token: bundle.agent_token,
                master_key: bundle.master_key,
            }),
            timeout: bundle.timeout.map(Duration::from_secs),
            shutdown: CancellationToken::new(),
            phase,
        }
    }

    /// Cancelling this token moves the agent to `Terminating`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    /// Bind `addr` (loopback only) and serve until shutdown.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        check_loopback(&addr)?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve queries on an already bound listener until the timeout fires,
    /// a termination signal arrives, or the shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        check_loopback(&local)?;

        if let Some(timeout) = self.timeout {
            debug!("Will time out in {} seconds", timeout.as_secs());
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        info!("Exiting because the agent has outlived its timeout");
                        shutdown.cancel();
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        }
        tokio::spawn(cancel_on_signal(self.shutdown.clone()));

        let app = router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .into_future();

        self.phase.send_replace(AgentPhase::Serving);
        info!("Agent listening on {}", local);

        let drain_deadline = {
            let shutdown = self.shutdown.clone();
            async move {
                shutdown.cancelled().await;
                tokio::time::sleep(DRAIN_GRACE).await;
            }
        };

        let result = tokio::select! {
            res = server => res.map_err(RelayError::from),
            _ = drain_deadline => {
                warn!("In-flight requests did not finish within {:?}, dropping them", DRAIN_GRACE);
                Ok(())
            }
        };

        self.phase.send_replace(AgentPhase::Terminating);
        info!("Agent stopped");
        result
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
