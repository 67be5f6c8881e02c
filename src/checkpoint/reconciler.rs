//! Checkpoint reconciler
//!
//! Loads the most recent checkpoint's message list for seeding, and compares
//! a local transcript against durable history for diagnostics. Nothing here
//! writes to a transcript; seeding goes through the interpreter.

use super::CheckpointStore;
use crate::error::{EngineError, Result};
use crate::message::normalizer::messages_field;
use crate::message::Message;
use crate::metrics::METRICS;
use crate::time_operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Differences between a local transcript and durable history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub local_only: Vec<String>,
    pub remote_only: Vec<String>,
    /// Same id, different content
    pub divergent: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.local_only.is_empty() && self.remote_only.is_empty() && self.divergent.is_empty()
    }
}

/// Reads durable history through a [`CheckpointStore`]
pub struct CheckpointReconciler {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointReconciler {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Message list of the most recent checkpoint
    ///
    /// Zero checkpoints yields an empty list. Any fetch or parse failure is
    /// reported as `CheckpointLoad`.
    pub async fn load(&self, thread_id: &str) -> Result<Vec<Message>> {
        debug!("Loading checkpoint history for thread {}", thread_id);

        let fetched = time_operation!(
            METRICS.remote_call_duration,
            "checkpoint_load",
            self.store.thread_checkpoints(thread_id).await
        );

        let result = fetched
            .map_err(|e| match e {
                EngineError::CheckpointLoad(_) => e,
                other => EngineError::CheckpointLoad(other.to_string()),
            })
            .and_then(|history| latest_messages(&history));

        METRICS.record_checkpoint_load(result.is_ok());
        match &result {
            Ok(messages) => info!(
                "Loaded {} messages from checkpoint history of thread {}",
                messages.len(),
                thread_id
            ),
            Err(e) => warn!("Checkpoint load for thread {} failed: {}", thread_id, e),
        }
        result
    }

    /// Load remote history and compare it with `local`
    pub async fn verify(&self, thread_id: &str, local: &[Message]) -> Result<ReconcileReport> {
        let remote = self.load(thread_id).await?;
        let report = compare(local, &remote);
        if !report.is_consistent() {
            warn!(
                "Thread {} diverges from history: {} local-only, {} remote-only, {} divergent",
                thread_id,
                report.local_only.len(),
                report.remote_only.len(),
                report.divergent.len()
            );
        }
        Ok(report)
    }
}

/// Extract the latest checkpoint's messages from any accepted history shape
pub fn latest_messages(history: &Value) -> Result<Vec<Message>> {
    let latest = match history {
        Value::Null => return Ok(Vec::new()),
        Value::Array(checkpoints) => match checkpoints.last() {
            Some(checkpoint) => checkpoint,
            None => return Ok(Vec::new()),
        },
        Value::Object(_) => history,
        other => {
            return Err(EngineError::CheckpointLoad(format!(
                "unexpected checkpoint history of type {}",
                json_type(other)
            )))
        }
    };

    let holder = latest.get("values").unwrap_or(latest);
    if !holder.is_object() {
        return Err(EngineError::CheckpointLoad(
            "checkpoint values must be an object".to_string(),
        ));
    }
    messages_field(holder).map_err(|e| EngineError::CheckpointLoad(e.to_string()))
}

/// Diagnostic diff by id; never repairs either side
pub fn compare(local: &[Message], remote: &[Message]) -> ReconcileReport {
    let remote_by_id: HashMap<&str, &Message> =
        remote.iter().map(|m| (m.id.as_str(), m)).collect();
    let local_ids: HashSet<&str> = local.iter().map(|m| m.id.as_str()).collect();

    let mut report = ReconcileReport::default();
    for message in local {
        match remote_by_id.get(message.id.as_str()) {
            None => report.local_only.push(message.id.clone()),
            Some(remote) if remote.content != message.content => {
                report.divergent.push(message.id.clone())
            }
            Some(_) => {}
        }
    }
    report.remote_only = remote
        .iter()
        .filter(|m| !local_ids.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect();
    report
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
