//! Canonical message model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the assistant; always delivered whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Canonical conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Assistant only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Create a message with a fresh id
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), role, content)
    }

    pub fn with_id(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
            tool_call_id: None,
            extra: Map::new(),
        }
    }

    /// Human message with a client-assigned id
    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_id(id, Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Tool result answering `tool_call_id`
    pub fn tool(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut message = Self::with_id(id, Role::Tool, content);
        message.tool_name = Some(tool_name.into());
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Merge tool calls by id, keeping first-seen order
    pub fn merge_tool_calls(&mut self, calls: &[ToolCall]) {
        for call in calls {
            if !self.tool_calls.iter().any(|existing| existing.id == call.id) {
                self.tool_calls.push(call.clone());
            }
        }
    }

    /// Wire form sent to the service for a human turn
    pub fn to_wire(&self) -> Value {
        let kind = match self.role {
            Role::Human => "human",
            Role::Assistant => "ai",
            Role::System => "system",
            Role::Tool => "tool",
        };
        let mut wire = Map::new();
        wire.insert("type".to_string(), Value::String(kind.to_string()));
        wire.insert("id".to_string(), Value::String(self.id.clone()));
        wire.insert("content".to_string(), Value::String(self.content.clone()));
        if !self.tool_calls.is_empty() {
            let calls = self
                .tool_calls
                .iter()
                .map(|c| serde_json::json!({"id": c.id, "name": c.name, "args": c.arguments}))
                .collect();
            wire.insert("tool_calls".to_string(), Value::Array(calls));
        }
        if let Some(name) = &self.tool_name {
            wire.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(call_id) = &self.tool_call_id {
            wire.insert("tool_call_id".to_string(), Value::String(call_id.clone()));
        }
        Value::Object(wire)
    }
}
