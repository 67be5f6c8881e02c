//! HTTP transport over server-sent events

use super::{EventStream, StreamMode, StreamRequest, Transport};
use crate::config::TransportConfig;
use crate::error::{EngineError, Result};
use crate::stream::{classify, StreamEnvelope};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, error, trace};

/// Default SSE event name when a frame carries none
const DEFAULT_SSE_EVENT: &str = "message";

/// Transport posting runs to `{base_url}/threads/{thread_id}/runs/stream`
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    assistant_id: String,
    stream_mode: Vec<StreamMode>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        // no overall timeout; stall detection lives in the session
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::new(key.expose_secret().clone())),
            assistant_id: config.assistant_id.clone(),
            stream_mode: config.stream_mode.clone(),
        })
    }

    fn run_url(&self, thread_id: &str) -> String {
        format!("{}/threads/{}/runs/stream", self.base_url, thread_id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, thread_id: &str, request: StreamRequest) -> Result<EventStream> {
        let payload = request.to_payload(&self.assistant_id, &self.stream_mode);
        let url = self.run_url(thread_id);
        debug!("Opening run stream at {} (resume: {})", url, request.is_resume());

        let mut req = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("Failed to open stream: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Run stream rejected: HTTP {}", status);
            return Err(EngineError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let thread = thread_id.to_string();
        let events = response.bytes_stream().eventsource().flat_map(move |frame| {
            let batch = match frame {
                Ok(sse) => decode_frame(&thread, &sse.event, &sse.data),
                Err(e) => vec![Err(EngineError::Transport(format!("SSE stream error: {}", e)))],
            };
            futures::stream::iter(batch)
        });

        Ok(Box::pin(events))
    }
}

/// Turn one SSE frame into zero or more envelopes for `thread_id`
pub(crate) fn decode_frame(thread_id: &str, event: &str, data: &str) -> Vec<Result<StreamEnvelope>> {
    trace!("SSE frame event={} ({} bytes)", event, data.len());

    let name = Some(event).filter(|name| !name.is_empty() && *name != DEFAULT_SSE_EVENT);
    let data = if data.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str::<Value>(data) {
            Ok(value) => value,
            Err(e) => {
                return vec![Err(EngineError::Protocol(format!(
                    "SSE data is not JSON: {}",
                    e
                )))]
            }
        }
    };

    match classify(name, &data) {
        Ok(events) => events
            .into_iter()
            .map(|event| Ok(StreamEnvelope::new(thread_id, event)))
            .collect(),
        Err(e) => vec![Err(e)],
    }
}
