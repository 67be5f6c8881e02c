//! HTTP checkpoint store

use super::CheckpointStore;
use crate::config::{CheckpointConfig, TransportConfig};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

/// Reads `GET {base_url}/threads/{thread_id}/history`
pub struct HttpCheckpointStore {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpCheckpointStore {
    pub fn new(transport: &TransportConfig, config: &CheckpointConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(transport.connect_timeout())
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: transport.base_url.trim_end_matches('/').to_string(),
            api_key: transport
                .api_key
                .as_ref()
                .map(|key| SecretString::new(key.expose_secret().clone())),
        })
    }

    fn history_url(&self, thread_id: &str) -> String {
        format!("{}/threads/{}/history", self.base_url, thread_id)
    }
}

#[async_trait]
impl CheckpointStore for HttpCheckpointStore {
    async fn thread_checkpoints(&self, thread_id: &str) -> Result<Value> {
        let url = self.history_url(thread_id);
        debug!("Fetching checkpoint history from {}", url);

        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::CheckpointLoad(format!("history request timed out: {}", e))
            } else {
                EngineError::CheckpointLoad(format!("history request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("No checkpoint history for thread {}", thread_id);
            return Ok(Value::Array(Vec::new()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::CheckpointLoad(format!("HTTP {}: {}", status, body)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::CheckpointLoad(format!("Failed to parse history: {}", e)))
    }
}
