//! HTTP client for the agent's query endpoint.

use std::time::Duration;

use super::protocol::{RelayRequest, RelayResponse};
use crate::error::Result;

/// Queries an agent on `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RelayClient {
    pub fn new(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("http://127.0.0.1:{}/", port),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `{"key": token}` and decode the reply, whatever its status code.
    pub async fn query(&self, token: &str) -> Result<RelayResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&RelayRequest {
                key: token.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<RelayResponse>().await?;
        tracing::debug!("Agent replied with status {}", status);
        Ok(body)
    }
}
