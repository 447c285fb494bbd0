//! # keyrelay
//!
//! Short-lived secret relay: a disposable agent process holds a decrypted
//! master key in memory and hands it back over loopback HTTP to callers that
//! present the matching agent token.
//!
//! ## Architecture
//!
//! ```text
//!   SecretStore (sqlite key/value)
//!        │ set_master_key                     get_master_key
//!        ▼                                          │
//!   AgentProcessManager ──spawn + stdin bundle──▶ keyrelay-agent
//!        │ agent.pid / agent.lock                   ▲
//!        └──────────────────────────────────────────┘
//!                       POST {"key": token} on 127.0.0.1:<port>
//! ```
//!
//! ## Modules
//! - `agent`: agent state machine and its HTTP route
//! - `process`: PID marker, replacement lock, spawning and termination
//! - `relay`: startup bundle, query messages, HTTP client
//! - `store`: key/value backend, typed configuration, master key paths

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod relay;
pub mod store;
pub mod util;

pub use config::Config;
pub use error::{RelayError, Result};
pub use store::SecretStore;
