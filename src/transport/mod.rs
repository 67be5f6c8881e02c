//! Streaming transport seam
//!
//! A transport opens one run against a thread and yields classified events.
//! Dropping the returned stream cancels the run.

pub mod http;
pub mod scripted;

use crate::error::Result;
use crate::message::Message;
use crate::stream::StreamEnvelope;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::pin::Pin;

pub use http::HttpTransport;
pub use scripted::{ScriptStep, ScriptedTransport};

/// Event stream returned by [`Transport::open_stream`]
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEnvelope>> + Send>>;

/// Stream modes a run can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Messages,
    Updates,
    Values,
}

/// Per-run configuration map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,

    /// Empty means the transport's configured modes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_mode: Vec<StreamMode>,

    /// Additional `configurable` keys passed through untouched
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RunConfig {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            selected_model: Some(model.into()),
            ..Default::default()
        }
    }
}

/// One run request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRequest {
    /// Human turn; `None` for a resume
    pub input: Option<Message>,
    pub config: RunConfig,
    /// Decision answering a pending interrupt
    pub resume: Option<Value>,
    /// Caller identity
    pub caller: Option<String>,
}

impl StreamRequest {
    pub fn submit(input: Message, config: RunConfig) -> Self {
        Self {
            input: Some(input),
            config,
            ..Default::default()
        }
    }

    pub fn resume(decision: Value, config: RunConfig) -> Self {
        Self {
            resume: Some(decision),
            config,
            ..Default::default()
        }
    }

    pub fn is_resume(&self) -> bool {
        self.resume.is_some()
    }

    /// Serialize the run body
    ///
    /// `default_modes` fills `stream_mode` when the request does not name any.
    pub fn to_payload(&self, assistant_id: &str, default_modes: &[StreamMode]) -> Value {
        let modes = if self.config.stream_mode.is_empty() {
            default_modes
        } else {
            self.config.stream_mode.as_slice()
        };

        let mut configurable = self.config.extra.clone();
        if let Some(model) = &self.config.selected_model {
            configurable.insert("selected_model".to_string(), json!(model));
        }

        let mut payload = json!({
            "assistant_id": assistant_id,
            "input": self.input.as_ref().map(|m| json!({ "messages": [m.to_wire()] })),
            "config": { "configurable": configurable },
            "stream_mode": modes,
        });

        if let Some(decision) = &self.resume {
            payload["command"] = json!({ "resume": decision });
        }
        if let Some(caller) = &self.caller {
            payload["metadata"] = json!({ "user_id": caller });
        }
        payload
    }
}

/// Opens event streams for a thread
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a run on `thread_id`
    ///
    /// An error here means nothing was sent; the thread id is not yet durable.
    async fn open_stream(&self, thread_id: &str, request: StreamRequest) -> Result<EventStream>;
}
