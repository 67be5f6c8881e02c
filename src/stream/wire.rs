//! Classification of raw `(event name, JSON data)` frames into stream events
//!
//! Event names follow the service's stream modes (`messages`, `updates`,
//! `values`) plus the control frames `heartbeat`, `metadata`, `error` and
//! `end`. A `|namespace` suffix on the name (subgraph streams) is ignored.
//! Frames without a name are classified by data shape.

use super::events::{MessageDelta, NodeUpdate, StreamEvent, TokenUsage};
use crate::error::{EngineError, Result};
use crate::message::normalizer::{
    extract_content, extract_tool_calls, messages_field, normalize_message, normalize_messages,
    normalize_role,
};
use crate::message::Role;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

const INTERRUPT_KEY: &str = "__interrupt__";
const TOKEN_USAGE_KEY: &str = "token_usage";

/// Classify one frame; an empty result means the frame carries nothing to apply
pub fn classify(event: Option<&str>, data: &Value) -> Result<Vec<StreamEvent>> {
    let name = event
        .map(|name| name.split('|').next().unwrap_or(name).trim())
        .filter(|name| !name.is_empty());

    match name {
        Some("messages") | Some("messages-tuple") => classify_messages(data),
        Some("messages/partial") => {
            let items = data.as_array().cloned().unwrap_or_else(|| vec![data.clone()]);
            items
                .iter()
                .map(|item| parse_delta(item, None).map(|delta| StreamEvent::Delta(delta.cumulative())))
                .collect()
        }
        Some("messages/complete") => {
            let items = data.as_array().cloned().unwrap_or_else(|| vec![data.clone()]);
            let messages = normalize_messages(&items)?;
            Ok(vec![StreamEvent::node_update("messages", messages)])
        }
        Some("updates") => classify_updates(data),
        Some("values") => classify_values(data),
        Some("custom") => Ok(parse_token_usage(data)?.into_iter().map(StreamEvent::TokenUsage).collect()),
        Some("heartbeat") => Ok(vec![StreamEvent::Heartbeat {
            timestamp: parse_timestamp(data.get("timestamp")),
        }]),
        Some("metadata") => Ok(vec![StreamEvent::Heartbeat { timestamp: None }]),
        Some("error") => Ok(vec![StreamEvent::error(error_cause(data))]),
        Some("end") => Ok(vec![StreamEvent::End]),
        Some(other) => Err(EngineError::Protocol(format!("unrecognized stream event '{}'", other))),
        None => classify_by_shape(data),
    }
}

fn classify_messages(data: &Value) -> Result<Vec<StreamEvent>> {
    match data {
        Value::Array(items) if is_tuple(items) => {
            Ok(vec![StreamEvent::Delta(parse_delta(&items[0], items.get(1))?)])
        }
        Value::Array(items) => items
            .iter()
            .map(|item| parse_delta(item, None).map(StreamEvent::Delta))
            .collect(),
        other => Ok(vec![StreamEvent::Delta(parse_delta(other, None)?)]),
    }
}

/// `[chunk, metadata]` where metadata is not itself a message
fn is_tuple(items: &[Value]) -> bool {
    items.len() == 2
        && items[1].is_object()
        && items[1].get("type").is_none()
        && items[1].get("role").is_none()
}

fn classify_updates(data: &Value) -> Result<Vec<StreamEvent>> {
    let obj = data
        .as_object()
        .ok_or_else(|| EngineError::Protocol("updates payload must be an object".to_string()))?;

    if let Some(payload) = obj.get(INTERRUPT_KEY) {
        return Ok(vec![StreamEvent::interrupt(unwrap_interrupt(payload))]);
    }
    if let Some(usage) = parse_token_usage(data)? {
        return Ok(vec![StreamEvent::TokenUsage(usage)]);
    }

    let mut updates = Vec::new();
    for (producer, update) in obj {
        let messages = match update.get("messages") {
            Some(Value::Array(_)) => messages_field(update)?,
            Some(single @ Value::Object(_)) => vec![normalize_message(single)?],
            _ => continue,
        };
        updates.push(NodeUpdate {
            producer: producer.clone(),
            messages,
        });
    }

    if updates.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![StreamEvent::NodeUpdate { updates }])
}

fn classify_values(data: &Value) -> Result<Vec<StreamEvent>> {
    if let Some(payload) = data.get(INTERRUPT_KEY) {
        return Ok(vec![StreamEvent::interrupt(unwrap_interrupt(payload))]);
    }
    if data.get("messages").is_none() {
        return Ok(Vec::new());
    }
    Ok(vec![StreamEvent::snapshot(messages_field(data)?)])
}

fn classify_by_shape(data: &Value) -> Result<Vec<StreamEvent>> {
    if let Some(usage) = parse_token_usage(data)? {
        return Ok(vec![StreamEvent::TokenUsage(usage)]);
    }
    if let Some(payload) = data.get(INTERRUPT_KEY) {
        return Ok(vec![StreamEvent::interrupt(unwrap_interrupt(payload))]);
    }
    if data.get("messages").is_some() {
        return classify_values(data);
    }
    if data.get("type").is_some() && data.get("content").is_some() {
        return classify_messages(data);
    }
    if let Some(obj) = data.as_object() {
        if obj.len() == 1 && obj.contains_key("timestamp") {
            return Ok(vec![StreamEvent::Heartbeat {
                timestamp: parse_timestamp(obj.get("timestamp")),
            }]);
        }
    }
    Err(EngineError::Protocol("unclassifiable stream frame".to_string()))
}

/// Parse a message chunk into a delta
fn parse_delta(chunk: &Value, metadata: Option<&Value>) -> Result<MessageDelta> {
    let obj = chunk
        .as_object()
        .ok_or_else(|| EngineError::Protocol("delta chunk must be an object".to_string()))?;

    let role = match obj.get("type").or_else(|| obj.get("role")).and_then(Value::as_str) {
        Some(tag) => normalize_role(tag)
            .ok_or_else(|| EngineError::Protocol(format!("unrecognized delta role '{}'", tag)))?,
        None => Role::Assistant,
    };

    let seq = ["seq", "sequence"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_u64))
        .or_else(|| metadata.and_then(|m| m.get("seq")).and_then(Value::as_u64));

    let mut extra = match obj.get("extra") {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    if let Some(meta) = metadata.filter(|m| m.as_object().map_or(false, |o| !o.is_empty())) {
        extra.insert("metadata".to_string(), meta.clone());
    }

    Ok(MessageDelta {
        id: obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        role,
        content: extract_content(obj.get("content")),
        seq,
        cumulative: false,
        tool_calls: extract_tool_calls(obj.get("tool_calls")),
        extra,
    })
}

/// `{token_usage: {used, total, remaining?, percentage?}}`
fn parse_token_usage(data: &Value) -> Result<Option<TokenUsage>> {
    let Some(usage) = data.get(TOKEN_USAGE_KEY) else {
        return Ok(None);
    };
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).map(|v| v as usize);
    let (Some(used), Some(total)) = (field("used"), field("total")) else {
        return Err(EngineError::Protocol("token_usage requires used and total".to_string()));
    };
    Ok(Some(TokenUsage {
        used,
        total,
        remaining: field("remaining").unwrap_or_else(|| total.saturating_sub(used)),
        percentage: usage.get("percentage").and_then(Value::as_f64),
    }))
}

/// A single `[{value, resumable, ns}]` interrupt collapses to its value
fn unwrap_interrupt(payload: &Value) -> Value {
    match payload {
        Value::Array(items) if items.len() == 1 => items[0]
            .get("value")
            .cloned()
            .unwrap_or_else(|| items[0].clone()),
        other => other.clone(),
    }
}

fn error_cause(data: &Value) -> String {
    match data {
        Value::String(text) => text.clone(),
        Value::Null => "unknown stream error".to_string(),
        other => other
            .get("message")
            .or_else(|| other.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

/// RFC 3339 strings, or epoch numbers in seconds or milliseconds
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            if raw > 1_000_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}
