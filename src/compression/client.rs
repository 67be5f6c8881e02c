//! HTTP compression service

use super::{CompressionOptions, CompressionService};
use crate::config::CompressionConfig;
use crate::error::{EngineError, Result};
use crate::message::normalizer::messages_field;
use crate::message::Message;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Client for a summarizer endpoint accepting `{messages, options}`
pub struct HttpCompressionService {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    max_retries: usize,
    retry_backoff: Duration,
}

#[derive(Debug, Serialize)]
struct CompressionRequest<'a> {
    messages: Vec<Value>,
    options: &'a CompressionOptions,
}

impl HttpCompressionService {
    pub fn new(config: &CompressionConfig, api_key: Option<&SecretString>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.map(|key| SecretString::new(key.expose_secret().clone())),
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
        })
    }

    async fn attempt(&self, body: &CompressionRequest<'_>) -> Result<Vec<Message>> {
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| EngineError::compression_retriable(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status, body);
            // client errors will not improve on retry
            return Err(if status.is_client_error() {
                EngineError::compression_fatal(message)
            } else {
                EngineError::compression_retriable(message)
            });
        }

        let reply: Value = response.json().await.map_err(|e| {
            EngineError::compression_retriable(format!("Failed to parse response: {}", e))
        })?;
        messages_field(&reply)
            .map_err(|e| EngineError::compression_retriable(format!("Malformed response: {}", e)))
    }
}

#[async_trait]
impl CompressionService for HttpCompressionService {
    async fn compress(
        &self,
        messages: &[Message],
        options: &CompressionOptions,
    ) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let body = CompressionRequest {
            messages: messages.iter().map(Message::to_wire).collect(),
            options,
        };

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} for compression", attempt);
                tokio::time::sleep(self.retry_backoff * 2u32.pow(attempt as u32 - 1)).await;
            }

            match self.attempt(&body).await {
                Ok(reply) => {
                    debug!("Compression returned {} messages", reply.len());
                    return Ok(reply);
                }
                Err(e) if e.is_retriable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        warn!("Compression failed after {} attempts", self.max_retries);
        Err(last_error.unwrap_or_else(|| {
            EngineError::compression_retriable("compression failed without a response")
        }))
    }
}
