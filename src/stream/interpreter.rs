//! Stream event interpreter
//!
//! Applies one event at a time to the transcript, strictly in delivery order.
//! The interpreter is the transcript's only writer and owns the streaming
//! cursor lifecycle:
//!
//! - set by the first delta for a message id
//! - advanced in place by further deltas with the same id
//! - cleared by `snapshot`, by a `node_update` carrying an assistant
//!   message, by `end`, and when a new local turn begins
//!
//! Redelivery detection: with sequence numbers, any fragment whose number is
//! not above the last applied one is dropped. Without them, a fragment equal
//! to the immediately preceding fragment for the same id is dropped. The
//! latter cannot tell a redelivery from a genuinely repeated fragment, and
//! reordered fragments without sequence numbers are applied as delivered.

use super::events::{MessageDelta, StreamEvent, TokenUsage};
use crate::error::{EngineError, Result};
use crate::message::{Message, Role};
use crate::metrics::METRICS;
use crate::transcript::{StreamingCursor, Transcript};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

/// Session-level effect of consuming one event
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The transcript was updated
    Applied,
    /// Redelivered or already-finalized content; nothing changed
    Ignored,
    Interrupt(Value),
    TokenUsage(TokenUsage),
    Heartbeat,
    Failed(String),
    /// The event could not be applied; the transcript is unchanged
    Rejected(EngineError),
    Completed,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpreterStats {
    pub applied: u64,
    pub duplicates: u64,
    pub finalized_drops: u64,
}

/// Classifies events and mutates the transcript
#[derive(Debug, Default)]
pub struct Interpreter {
    stats: InterpreterStats,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> InterpreterStats {
        self.stats
    }

    /// Apply one event
    pub fn consume(&mut self, event: StreamEvent, transcript: &mut Transcript) -> Transition {
        let kind = event.kind();
        trace!("Consuming {} event", kind);

        let transition = match event {
            StreamEvent::Delta(delta) => self.apply_delta(delta, transcript),
            StreamEvent::Snapshot { messages } => {
                debug!("Snapshot replaces transcript with {} messages", messages.len());
                match transcript.replace_all(messages) {
                    Ok(()) => Transition::Applied,
                    Err(e) => Transition::Rejected(e),
                }
            }
            StreamEvent::NodeUpdate { updates } => {
                let mut concluded = false;
                for update in updates {
                    debug!(
                        "Node update from '{}' with {} messages",
                        update.producer,
                        update.messages.len()
                    );
                    for message in update.messages {
                        concluded |= message.is_assistant();
                        self.upsert(message, transcript);
                    }
                }
                if concluded {
                    if let Some(id) = transcript.clear_cursor() {
                        debug!("Cursor on {} cleared by node update", id);
                    }
                }
                Transition::Applied
            }
            StreamEvent::Interrupt { payload } => Transition::Interrupt(payload),
            StreamEvent::TokenUsage(usage) => Transition::TokenUsage(usage),
            StreamEvent::Heartbeat { .. } => Transition::Heartbeat,
            StreamEvent::Error { cause } => Transition::Failed(cause),
            StreamEvent::End => {
                transcript.clear_cursor();
                Transition::Completed
            }
        };

        match transition {
            Transition::Ignored | Transition::Rejected(_) => {}
            _ => {
                self.stats.applied += 1;
                METRICS.record_event(kind);
            }
        }
        transition
    }

    /// Append a locally originated message (the optimistic human turn)
    ///
    /// A new local turn ends any delta stream still under the cursor.
    pub fn append_local(&mut self, message: Message, transcript: &mut Transcript) -> bool {
        transcript.clear_cursor();
        transcript.append(message)
    }

    /// Seed the transcript from durable history
    pub fn seed(&mut self, messages: Vec<Message>, transcript: &mut Transcript) -> Result<()> {
        transcript.replace_all(messages)
    }

    /// Close the cursor without a terminal event (cancelled or failed turn)
    ///
    /// Partial content already applied is kept.
    pub fn finalize(&mut self, transcript: &mut Transcript) -> Option<String> {
        transcript.clear_cursor()
    }

    /// Drop everything (explicit new session)
    pub fn reset(&mut self, transcript: &mut Transcript) {
        transcript.clear();
        self.stats = InterpreterStats::default();
    }

    /// Replace content of several messages as one batch
    ///
    /// Every id must exist and none may be under the streaming cursor;
    /// otherwise nothing is changed.
    pub fn splice(
        &mut self,
        replacements: &HashMap<String, String>,
        transcript: &mut Transcript,
    ) -> Result<usize> {
        let streaming = transcript.cursor().map(|c| c.message_id.as_str());
        let mut missing: Vec<&str> = replacements
            .keys()
            .map(String::as_str)
            .filter(|id| !transcript.contains(id) || Some(*id) == streaming)
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(EngineError::InvalidState(format!(
                "cannot splice unknown or streaming messages: {}",
                missing.join(", ")
            )));
        }

        for (id, content) in replacements {
            transcript.replace_content(id, content.clone());
        }
        Ok(replacements.len())
    }

    fn apply_delta(&mut self, delta: MessageDelta, transcript: &mut Transcript) -> Transition {
        let cursor_id = transcript.cursor().map(|c| c.message_id.clone());
        let target = delta.id.clone().or_else(|| cursor_id.clone());

        match target {
            Some(id) if Some(&id) == cursor_id.as_ref() => self.extend(id, delta, transcript),
            Some(id) if transcript.contains(&id) => {
                debug!("Dropping delta for finalized message {}", id);
                self.stats.finalized_drops += 1;
                METRICS.record_dropped("finalized");
                Transition::Ignored
            }
            Some(id) => self.start(id, delta, transcript),
            None => self.start(Uuid::new_v4().to_string(), delta, transcript),
        }
    }

    fn start(&mut self, id: String, delta: MessageDelta, transcript: &mut Transcript) -> Transition {
        let role = match delta.role {
            Role::Human | Role::System => Role::Assistant,
            other => other,
        };
        let mut message = Message::with_id(id.clone(), role, delta.content.clone());
        message.tool_calls = delta.tool_calls;
        message.extra = delta.extra;

        if let Some(previous) = transcript.clear_cursor() {
            debug!("Cursor moves from {} to {}", previous, id);
        }
        transcript.append(message);
        transcript.set_cursor(StreamingCursor {
            message_id: id,
            last_seq: delta.seq,
            last_fragment: Some(delta.content).filter(|c| !c.is_empty()),
        });
        Transition::Applied
    }

    fn extend(&mut self, id: String, delta: MessageDelta, transcript: &mut Transcript) -> Transition {
        if let Some(cursor) = transcript.cursor_mut() {
            let redelivered = match delta.seq {
                Some(seq) => cursor.last_seq.map_or(false, |last| seq <= last),
                None => {
                    !delta.cumulative
                        && delta.tool_calls.is_empty()
                        && !delta.content.is_empty()
                        && cursor.last_fragment.as_deref() == Some(delta.content.as_str())
                }
            };
            if redelivered {
                trace!("Dropping redelivered fragment for {}", id);
                self.stats.duplicates += 1;
                METRICS.record_dropped("duplicate");
                return Transition::Ignored;
            }
            if delta.seq.is_some() {
                cursor.last_seq = delta.seq;
            }
            if !delta.content.is_empty() {
                cursor.last_fragment = Some(delta.content.clone());
            }
        }

        if !transcript.contains(&id) {
            // cursor pointed at a message a snapshot removed; start over
            transcript.clear_cursor();
            return self.start(id, delta, transcript);
        }
        let Some(message) = transcript.get_mut(&id) else {
            return Transition::Ignored;
        };

        if delta.cumulative {
            message.content = delta.content;
        } else {
            message.content.push_str(&delta.content);
        }
        message.merge_tool_calls(&delta.tool_calls);
        for (key, value) in delta.extra {
            message.extra.insert(key, value);
        }
        Transition::Applied
    }

    /// Append, or replace in place when the id is already present
    fn upsert(&mut self, message: Message, transcript: &mut Transcript) {
        if let Some(existing) = transcript.get_mut(&message.id) {
            *existing = message;
        } else {
            transcript.append(message);
        }
    }
}
