//! Normalization of heterogeneous wire shapes into canonical messages
//!
//! Every ingestion point (stream deltas, node updates, snapshots, checkpoint
//! history, compression responses) goes through this module. Accepted shapes:
//!
//! - `{type|role, id, content, tool_calls, name, tool_call_id, ...}`
//! - serialized constructors `{lc, type: "constructor", id: [.., "AIMessage"], kwargs}`
//! - content as a string or as an array of `{type: "text", text}` parts
//! - role tags with optional `Message` / `Chunk` suffixes (`AIMessageChunk`)
//!
//! Messages without an id get one. Inside a list the id is derived from the
//! position, role and content, so the same history normalizes to the same
//! ids every time. A lone message has no position and gets a random id.

use super::models::{Message, Role, ToolCall};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys consumed into canonical fields; everything else lands in `extra`
const KNOWN_KEYS: &[&str] = &[
    "type",
    "role",
    "id",
    "content",
    "tool_calls",
    "tool_call_id",
    "tool_name",
    "extra",
    "lc",
];

/// Map a wire role tag to a canonical role
///
/// Case-insensitive; a trailing `chunk` and then `message` suffix are
/// stripped first, so `AIMessageChunk`, `ai_chunk` and `ai` all map to
/// [`Role::Assistant`].
pub fn normalize_role(tag: &str) -> Option<Role> {
    let lowered = tag.trim().to_ascii_lowercase();
    let mut base = lowered.as_str();
    for suffix in ["chunk", "message"] {
        if let Some(stripped) = base.strip_suffix(suffix) {
            base = stripped.trim_end_matches(['_', '-']);
        }
    }

    match base {
        "human" | "user" => Some(Role::Human),
        "ai" | "assistant" => Some(Role::Assistant),
        "system" | "developer" => Some(Role::System),
        "tool" | "function" => Some(Role::Tool),
        _ => None,
    }
}

/// Whether a role tag carries the streaming chunk suffix
pub fn is_chunk_tag(tag: &str) -> bool {
    tag.trim().to_ascii_lowercase().ends_with("chunk")
}

/// Normalize one wire message
pub fn normalize_message(value: &Value) -> Result<Message> {
    normalize_at(value, None)
}

fn normalize_at(value: &Value, position: Option<usize>) -> Result<Message> {
    let (tag, body) = unwrap_constructor(value)?;
    let role = normalize_role(&tag)
        .ok_or_else(|| EngineError::Protocol(format!("unrecognized message role '{}'", tag)))?;
    let content = extract_content(body.get("content"));

    let id = match body.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => match position {
            Some(position) => positional_id(position, role, &content),
            None => Uuid::new_v4().to_string(),
        },
    };

    let mut message = Message::with_id(id, role, content);

    match role {
        Role::Assistant => {
            let calls = body
                .get("tool_calls")
                .or_else(|| body.get("additional_kwargs").and_then(|k| k.get("tool_calls")));
            message.tool_calls = extract_tool_calls(calls);
        }
        Role::Tool => {
            message.tool_name = body
                .get("tool_name")
                .or_else(|| body.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            message.tool_call_id = body
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Role::Human | Role::System => {}
    }

    message.extra = collect_extra(body, role);
    Ok(message)
}

/// Normalize a list of wire messages, failing on the first malformed entry
pub fn normalize_messages(values: &[Value]) -> Result<Vec<Message>> {
    values
        .iter()
        .enumerate()
        .map(|(position, value)| normalize_at(value, Some(position)))
        .collect()
}

fn positional_id(position: usize, role: Role, content: &str) -> String {
    let name = format!("{}:{}:{}", position, role.as_str(), content);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Extract and normalize the `messages` array of an object
///
/// A missing key yields an empty list; a non-array value is a protocol error.
pub fn messages_field(value: &Value) -> Result<Vec<Message>> {
    match value.get("messages") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => normalize_messages(items),
        Some(other) => Err(EngineError::Protocol(format!(
            "'messages' must be an array, got {}",
            json_kind(other)
        ))),
    }
}

/// Flatten content that may be a string or a list of parts
pub fn extract_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(obj) => {
                    let is_text = obj
                        .get("type")
                        .and_then(Value::as_str)
                        .map_or(true, |t| t == "text" || t == "text_delta");
                    if is_text {
                        obj.get("text").and_then(Value::as_str)
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

/// Parse tool calls in either `{id, name, args}` or `{id, function: {name, arguments}}` form
pub fn extract_tool_calls(calls: Option<&Value>) -> Vec<ToolCall> {
    let Some(Value::Array(calls)) = calls else {
        return Vec::new();
    };

    calls
        .iter()
        .filter_map(|call| {
            let function = call.get("function");
            let name = call
                .get("name")
                .or_else(|| function.and_then(|f| f.get("name")))
                .and_then(Value::as_str)?
                .to_string();
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let raw = call
                .get("args")
                .or_else(|| call.get("arguments"))
                .or_else(|| function.and_then(|f| f.get("arguments")))
                .cloned()
                .unwrap_or(Value::Null);
            Some(ToolCall {
                id,
                name,
                arguments: parse_arguments(raw),
            })
        })
        .collect()
}

fn parse_arguments(raw: Value) -> Value {
    match raw {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn unwrap_constructor(value: &Value) -> Result<(String, &Map<String, Value>)> {
    let obj = value.as_object().ok_or_else(|| {
        EngineError::Protocol(format!("message must be an object, got {}", json_kind(value)))
    })?;

    let is_constructor = obj.contains_key("lc")
        && obj.get("type").and_then(Value::as_str) == Some("constructor");
    if is_constructor {
        let tag = obj
            .get("id")
            .and_then(Value::as_array)
            .and_then(|path| path.last())
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol("constructor message without class id".to_string()))?;
        let kwargs = obj
            .get("kwargs")
            .and_then(Value::as_object)
            .ok_or_else(|| EngineError::Protocol("constructor message without kwargs".to_string()))?;
        return Ok((tag.to_string(), kwargs));
    }

    let tag = obj
        .get("type")
        .or_else(|| obj.get("role"))
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Protocol("message without type or role".to_string()))?;
    Ok((tag.to_string(), obj))
}

fn collect_extra(body: &Map<String, Value>, role: Role) -> Map<String, Value> {
    let mut extra = match body.get("extra") {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    for (key, value) in body {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        if role == Role::Tool && key == "name" {
            continue;
        }
        if role == Role::Assistant && key == "additional_kwargs" {
            let rest: Map<String, Value> = value
                .as_object()
                .map(|kwargs| {
                    kwargs
                        .iter()
                        .filter(|(k, _)| k.as_str() != "tool_calls")
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default();
            if !rest.is_empty() {
                extra.insert(key.clone(), Value::Object(rest));
            }
            continue;
        }
        if value.is_null() {
            continue;
        }
        extra.insert(key.clone(), value.clone());
    }
    extra
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
