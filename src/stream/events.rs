//! Typed stream events

use crate::message::{Message, Role, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Incremental fragment extending an in-progress message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDelta {
    /// Message the fragment belongs to; `None` extends the current cursor
    pub id: Option<String>,
    /// Role with any chunk suffix already stripped
    pub role: Role,
    pub content: String,
    /// Monotonic sequence number, when the transport supplies one
    pub seq: Option<u64>,
    /// Content is the full text so far rather than an increment
    pub cumulative: bool,
    pub tool_calls: Vec<ToolCall>,
    pub extra: Map<String, Value>,
}

impl MessageDelta {
    /// Assistant text fragment without sequencing
    pub fn text(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: Role::Assistant,
            content: content.into(),
            seq: None,
            cumulative: false,
            tool_calls: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn cumulative(mut self) -> Self {
        self.cumulative = true;
        self
    }
}

/// Messages produced by one graph node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub producer: String,
    pub messages: Vec<Message>,
}

/// Authoritative usage figures from the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub used: usize,
    pub total: usize,
    pub remaining: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

/// One classified event from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(MessageDelta),
    Snapshot { messages: Vec<Message> },
    NodeUpdate { updates: Vec<NodeUpdate> },
    Interrupt { payload: Value },
    TokenUsage(TokenUsage),
    Heartbeat { timestamp: Option<DateTime<Utc>> },
    Error { cause: String },
    End,
}

impl StreamEvent {
    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::Snapshot { .. } => "snapshot",
            Self::NodeUpdate { .. } => "node_update",
            Self::Interrupt { .. } => "interrupt",
            Self::TokenUsage(_) => "token_usage",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Error { .. } => "error",
            Self::End => "end",
        }
    }

    pub fn delta(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Delta(MessageDelta::text(id, content))
    }

    pub fn snapshot(messages: Vec<Message>) -> Self {
        Self::Snapshot { messages }
    }

    pub fn node_update(producer: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::NodeUpdate {
            updates: vec![NodeUpdate {
                producer: producer.into(),
                messages,
            }],
        }
    }

    pub fn interrupt(payload: Value) -> Self {
        Self::Interrupt { payload }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Some(Utc::now()),
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self::Error {
            cause: cause.into(),
        }
    }
}

/// An event tagged with the thread it was produced for
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnvelope {
    pub thread_id: Option<String>,
    pub event: StreamEvent,
}

impl StreamEnvelope {
    pub fn new(thread_id: impl Into<String>, event: StreamEvent) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            event,
        }
    }

    /// Envelope without thread attribution; never considered stale by thread
    pub fn untagged(event: StreamEvent) -> Self {
        Self {
            thread_id: None,
            event,
        }
    }

    /// Whether the envelope belongs to `active_thread`
    pub fn belongs_to(&self, active_thread: Option<&str>) -> bool {
        match (&self.thread_id, active_thread) {
            (Some(tagged), Some(active)) => tagged == active,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}
