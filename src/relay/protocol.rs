//! Wire messages for the startup handoff and the query endpoint.
//!
//! Both channels carry JSON. The startup bundle travels once, newline
//! terminated, over the agent's stdin. Queries are `POST /` bodies on the
//! agent's loopback listener.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::error::{RelayError, Result};

/// Default loopback port the agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 6277;

/// Random bytes behind each agent token, before base64 encoding.
pub const AGENT_TOKEN_BYTES: usize = 16;

pub const ERR_INVALID_JSON: &str = "invalid JSON";
pub const ERR_INVALID_TOKEN: &str = "invalid agent_token";
pub const ERR_USAGE: &str = "POST JSON with the secret key";

/// Shared secret authenticating queries to one agent instance.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentToken(String);

impl AgentToken {
    /// Fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; AGENT_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(BASE64.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact, length-checked comparison that does not short-circuit on the
    /// first differing byte.
    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl From<String> for AgentToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for AgentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentToken(<redacted>)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Payload written once to a freshly spawned agent's stdin.
#[derive(Clone, Serialize, Deserialize)]
pub struct StartupBundle {
    #[serde(default)]
    pub agent_token: Option<String>,
    /// Base64 of the decrypted master key.
    #[serde(default)]
    pub master_key: Option<String>,
    /// Seconds until the agent shuts itself down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<bool>,
}

impl fmt::Debug for StartupBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupBundle")
            .field("agent_token", &self.agent_token.as_ref().map(|_| "<redacted>"))
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("foreground", &self.foreground)
            .finish()
    }
}

impl StartupBundle {
    pub fn new(
        master_key: &[u8],
        agent_token: &AgentToken,
        timeout: Option<u64>,
        foreground: bool,
    ) -> Self {
        Self {
            agent_token: Some(agent_token.as_str().to_string()),
            master_key: Some(BASE64.encode(master_key)),
            timeout,
            foreground: foreground.then_some(true),
        }
    }

    /// Serialized form sent over the startup channel, newline terminated.
    pub fn to_line(&self) -> Result<Zeroizing<String>> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| RelayError::MalformedInput(format!("startup bundle: {}", e)))?;
        line.push('\n');
        Ok(Zeroizing::new(line))
    }

    /// Parse one startup line and check that the required fields are present.
    pub fn parse(line: &str) -> Result<AcceptedBundle> {
        let bundle: StartupBundle = serde_json::from_str(line.trim()).map_err(|_| {
            RelayError::MalformedInput(
                "invalid JSON on stdin, send the startup bundle as JSON".to_string(),
            )
        })?;

        let master_key = bundle
            .master_key
            .ok_or_else(|| RelayError::MalformedInput("startup bundle must have master_key".into()))?;
        let agent_token = bundle
            .agent_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RelayError::MalformedInput("startup bundle must have agent_token".into()))?;
        let master_key = BASE64
            .decode(master_key.as_bytes())
            .map_err(|e| RelayError::MalformedInput(format!("master_key is not base64: {}", e)))?;

        Ok(AcceptedBundle {
            agent_token: AgentToken(agent_token),
            master_key: Zeroizing::new(master_key),
            timeout: bundle.timeout,
            foreground: bundle.foreground.unwrap_or(false),
        })
    }
}

/// A validated startup bundle.
pub struct AcceptedBundle {
    pub agent_token: AgentToken,
    pub master_key: Zeroizing<Vec<u8>>,
    pub timeout: Option<u64>,
    pub foreground: bool,
}

/// Query body: `{"key": "<candidate token>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub key: String,
}

/// Agent reply: either the key or an error string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayResponse {
    MasterKey { master_key: String },
    Error { error: String },
}

impl RelayResponse {
    pub fn master_key(key: &[u8]) -> Self {
        Self::MasterKey {
            master_key: BASE64.encode(key),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Decode the key carried by a success response.
    pub fn into_master_key(self) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Self::MasterKey { master_key } => BASE64
                .decode(master_key.as_bytes())
                .map(Zeroizing::new)
                .map_err(|e| RelayError::MalformedInput(format!("master_key is not base64: {}", e))),
            Self::Error { error } if error == ERR_INVALID_TOKEN => {
                Err(RelayError::AuthenticationFailure)
            }
            Self::Error { error } => Err(RelayError::MalformedInput(error)),
        }
    }
}
