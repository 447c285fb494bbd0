//! Typed view over the key/value store.
//!
//! Every field is read and validated individually on [`StoreConfig::load`];
//! an invalid stored value fails the load with `InvalidConfig` naming the
//! field. Absent fields take their defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use super::KvStore;
use crate::error::{RelayError, Result};
use crate::relay::DEFAULT_AGENT_PORT;
use crate::util;

pub const KEY_IDENTITY_URL: &str = "identity_url";
pub const KEY_API_URL: &str = "api_url";
pub const KEY_DEBUG: &str = "debug";
pub const KEY_ENCRYPTION_KEY: &str = "encryption_key";
pub const KEY_CLIENT_TOKEN: &str = "client_token";
pub const KEY_AGENT_TOKEN: &str = "agent_token";
pub const KEY_AGENT_PORT: &str = "agent_port";

/// Every stored field, in display order.
pub const FIELDS: &[&str] = &[
    KEY_IDENTITY_URL,
    KEY_API_URL,
    KEY_DEBUG,
    KEY_ENCRYPTION_KEY,
    KEY_CLIENT_TOKEN,
    KEY_AGENT_TOKEN,
    KEY_AGENT_PORT,
];

const DEFAULT_IDENTITY_URL: &str = "https://identity.bitwarden.com/";
const DEFAULT_API_URL: &str = "https://api.bitwarden.com/";

/// Session issued by the upstream identity service.
///
/// Only `token_expires` (unix seconds) is interpreted; the rest is kept
/// verbatim.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientToken {
    pub token_expires: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClientToken {
    pub fn expiring_at(token_expires: i64) -> Self {
        Self {
            token_expires: token_expires as f64,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now as f64 > self.token_expires
    }

    /// Whole seconds until expiry; negative once expired.
    pub fn expires_in(&self, now: i64) -> i64 {
        (self.token_expires - now as f64).floor() as i64
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientToken")
            .field("token_expires", &self.token_expires)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct StoreConfig {
    /// Upstream identity endpoint
    pub identity_url: String,
    /// Upstream API endpoint
    pub api_url: String,
    pub debug: bool,
    /// Encrypted form of the master key; never decrypted here
    pub encryption_key: Option<String>,
    pub client_token: Option<ClientToken>,
    /// Token the running agent accepts
    pub agent_token: Option<String>,
    /// Loopback port the agent listens on
    pub agent_port: u16,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("identity_url", &self.identity_url)
            .field("api_url", &self.api_url)
            .field("debug", &self.debug)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<set>"))
            .field("client_token", &self.client_token)
            .field("agent_token", &self.agent_token.as_ref().map(|_| "<redacted>"))
            .field("agent_port", &self.agent_port)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            debug: false,
            encryption_key: None,
            client_token: None,
            agent_token: None,
            agent_port: DEFAULT_AGENT_PORT,
        }
    }
}

impl StoreConfig {
    /// Read every field from `store`, validating each one.
    pub async fn load(store: &dyn KvStore) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = store.get(KEY_IDENTITY_URL).await? {
            config.identity_url = parse_http_url(KEY_IDENTITY_URL, &v)?;
        }
        if let Some(v) = store.get(KEY_API_URL).await? {
            config.api_url = parse_http_url(KEY_API_URL, &v)?;
        }
        if let Some(v) = store.get(KEY_DEBUG).await? {
            config.debug = parse_debug(&v)?;
        }
        config.encryption_key = store.get(KEY_ENCRYPTION_KEY).await?;
        if let Some(v) = store.get(KEY_CLIENT_TOKEN).await? {
            config.client_token = parse_client_token(&v)?;
        }
        config.agent_token = store
            .get(KEY_AGENT_TOKEN)
            .await?
            .filter(|token| !token.is_empty());
        if let Some(v) = store.get(KEY_AGENT_PORT).await? {
            config.agent_port = parse_port(&v)?;
        }
        Ok(config)
    }

    /// Write every field that has a value.
    pub async fn save(&self, store: &dyn KvStore) -> Result<()> {
        for field in FIELDS {
            if let Some(value) = self.get_field(field)? {
                store.set(field, &value).await?;
            }
        }
        tracing::debug!("Saved configuration");
        Ok(())
    }

    /// Stored representation of `field`, `None` when unset.
    pub fn get_field(&self, field: &str) -> Result<Option<String>> {
        Ok(match field {
            KEY_IDENTITY_URL => Some(self.identity_url.clone()),
            KEY_API_URL => Some(self.api_url.clone()),
            KEY_DEBUG => Some(self.debug.to_string()),
            KEY_ENCRYPTION_KEY => self.encryption_key.clone(),
            KEY_CLIENT_TOKEN => match &self.client_token {
                Some(token) => Some(
                    serde_json::to_string(token)
                        .map_err(|e| RelayError::invalid_config(KEY_CLIENT_TOKEN, e.to_string()))?,
                ),
                None => None,
            },
            KEY_AGENT_TOKEN => self.agent_token.clone(),
            KEY_AGENT_PORT => Some(self.agent_port.to_string()),
            other => return Err(RelayError::invalid_config(other, "unknown field")),
        })
    }

    /// Validate `value` the same way `load` would and assign it.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            KEY_IDENTITY_URL => self.identity_url = parse_http_url(field, value)?,
            KEY_API_URL => self.api_url = parse_http_url(field, value)?,
            KEY_DEBUG => self.debug = parse_debug(value)?,
            KEY_ENCRYPTION_KEY => self.encryption_key = Some(value.to_string()),
            KEY_CLIENT_TOKEN => self.client_token = parse_client_token(value)?,
            KEY_AGENT_TOKEN => self.agent_token = Some(value.to_string()),
            KEY_AGENT_PORT => self.agent_port = parse_port(value)?,
            other => return Err(RelayError::invalid_config(other, "unknown field")),
        }
        Ok(())
    }
}

/// Normalized form of an http(s) URL.
fn parse_http_url(field: &str, value: &str) -> Result<String> {
    let url = Url::parse(value.trim()).map_err(|e| RelayError::invalid_config(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(RelayError::invalid_config(
            field,
            format!("scheme must be http or https, got {}", other),
        )),
    }
}

fn parse_debug(value: &str) -> Result<bool> {
    util::parse_bool(value)
        .ok_or_else(|| RelayError::invalid_config(KEY_DEBUG, format!("not a boolean: {}", value)))
}

fn parse_port(value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err(RelayError::invalid_config(KEY_AGENT_PORT, "port must be non-zero")),
        Ok(port) => Ok(port),
        Err(e) => Err(RelayError::invalid_config(KEY_AGENT_PORT, e.to_string())),
    }
}

/// `null` and the empty string mean "no session".
fn parse_client_token(value: &str) -> Result<Option<ClientToken>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| RelayError::invalid_config(KEY_CLIENT_TOKEN, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn empty_store_loads_defaults() {
        let store = MemoryStore::new();
        let config = StoreConfig::load(&store).await.unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.agent_port, 6277);
        assert_eq!(config.identity_url, "https://identity.bitwarden.com/");
    }

    #[tokio::test]
    async fn save_then_load_preserves_fields() {
        let store = MemoryStore::new();
        let mut config = StoreConfig::default();
        config.agent_port = 7100;
        config.debug = true;
        config.agent_token = Some("tok".to_string());
        config.encryption_key = Some("2.abc|def".to_string());
        let mut token = ClientToken::expiring_at(2_000_000_000);
        token
            .extra
            .insert("access_token".to_string(), serde_json::json!("xyz"));
        config.client_token = Some(token);
        config.save(&store).await.unwrap();

        let loaded = StoreConfig::load(&store).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn invalid_stored_port_names_the_field() {
        let store = MemoryStore::new();
        store.set(KEY_AGENT_PORT, "70000").await.unwrap();
        match StoreConfig::load(&store).await {
            Err(RelayError::InvalidConfig { field, .. }) => assert_eq!(field, KEY_AGENT_PORT),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }

        store.set(KEY_AGENT_PORT, "0").await.unwrap();
        assert!(StoreConfig::load(&store).await.is_err());
    }

    #[tokio::test]
    async fn invalid_client_token_is_rejected() {
        let store = MemoryStore::new();
        store.set(KEY_CLIENT_TOKEN, "{\"no_expiry\":1}").await.unwrap();
        assert!(matches!(
            StoreConfig::load(&store).await,
            Err(RelayError::InvalidConfig { .. })
        ));

        store.set(KEY_CLIENT_TOKEN, "null").await.unwrap();
        assert_eq!(StoreConfig::load(&store).await.unwrap().client_token, None);
    }

    #[test]
    fn set_field_validates() {
        let mut config = StoreConfig::default();
        config.set_field(KEY_API_URL, "http://localhost:8080").unwrap();
        assert_eq!(config.api_url, "http://localhost:8080/");
        assert!(config.set_field(KEY_API_URL, "ftp://example.com").is_err());
        assert!(config.set_field(KEY_DEBUG, "perhaps").is_err());
        assert!(config.set_field("colour", "blue").is_err());
        config.set_field(KEY_DEBUG, "yes").unwrap();
        assert!(config.debug);
        assert_eq!(config.get_field(KEY_DEBUG).unwrap().as_deref(), Some("true"));
        assert_eq!(config.get_field(KEY_AGENT_TOKEN).unwrap(), None);
    }

    #[test]
    fn client_token_expiry() {
        let token = ClientToken::expiring_at(1_000);
        assert!(!token.is_expired(999));
        assert!(!token.is_expired(1_000));
        assert!(token.is_expired(1_001));
        assert_eq!(token.expires_in(400), 600);
        assert!(token.expires_in(1_500) < 0);
    }

    #[test]
    fn client_token_accepts_fractional_expiry() {
        let token: ClientToken =
            serde_json::from_str(r#"{"token_expires": 1000.75, "access_token": "a"}"#).unwrap();
        assert_eq!(token.expires_in(900), 100);
        assert!(!format!("{:?}", token).contains("\"a\""));
    }
}
