//! Relay protocol shared by the owner, the agent and clients.
//!
//! ```text
//!   owner ──(stdin, one JSON line)──▶ agent        startup handoff
//!   client ──(POST / on 127.0.0.1)──▶ agent        query, repeatable
//! ```

pub mod client;
pub mod protocol;

pub use client::RelayClient;
pub use protocol::{
    AcceptedBundle, AgentToken, RelayRequest, RelayResponse, StartupBundle, DEFAULT_AGENT_PORT,
};
