//! Ordered transcript with id index and streaming cursor
//!
//! Mutators are crate-private: the stream interpreter is the only writer.
//! Messages are shared with snapshots and copied on write, so a snapshot
//! costs one pointer per message and only the edited message is cloned.

use crate::error::{EngineError, Result};
use crate::message::Message;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Immutable view handed to readers
pub type TranscriptSnapshot = Arc<Vec<Arc<Message>>>;

/// The assistant message currently receiving deltas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingCursor {
    pub message_id: String,
    /// Highest sequence number applied to this message
    pub last_seq: Option<u64>,
    /// Most recent fragment, for redelivery detection without sequence numbers
    pub last_fragment: Option<String>,
}

impl StreamingCursor {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            last_seq: None,
            last_fragment: None,
        }
    }
}

/// Ordered message list keyed by id
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: IndexMap<String, Arc<Message>>,
    cursor: Option<StreamingCursor>,
    revision: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from an ordered list; ids must be unique
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut transcript = Self::new();
        transcript.replace_all(messages)?;
        Ok(transcript)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    /// Position of a message in turn order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.get_index_of(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().map(Arc::as_ref)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last().map(|(_, message)| message.as_ref())
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.keys().cloned().collect()
    }

    pub fn cursor(&self) -> Option<&StreamingCursor> {
        self.cursor.as_ref()
    }

    /// Message currently under the cursor
    pub fn streaming_message(&self) -> Option<&Message> {
        self.cursor
            .as_ref()
            .and_then(|cursor| self.messages.get(&cursor.message_id))
            .map(Arc::as_ref)
    }

    /// Monotonic counter bumped on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Deep copy of every message
    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        Arc::new(self.messages.values().cloned().collect())
    }

    /// Append at the end; refuses an id that is already present
    pub(crate) fn append(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        self.messages.insert(message.id.clone(), Arc::new(message));
        self.revision += 1;
        true
    }

    /// Mutable access; clones the message first if a snapshot still shares it
    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let message = self.messages.get_mut(id)?;
        self.revision += 1;
        Some(Arc::make_mut(message))
    }

    /// Replace content of an existing message without moving it
    pub(crate) fn replace_content(&mut self, id: &str, content: String) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.content = content;
                true
            }
            None => false,
        }
    }

    /// Wholesale replacement; clears the cursor
    ///
    /// A list repeating an id is rejected and the transcript is left as it was.
    pub(crate) fn replace_all(&mut self, messages: Vec<Message>) -> Result<()> {
        {
            let mut seen = HashSet::with_capacity(messages.len());
            if let Some(duplicate) = messages.iter().find(|m| !seen.insert(m.id.as_str())) {
                return Err(EngineError::Protocol(format!(
                    "message list repeats id {}",
                    duplicate.id
                )));
            }
        }

        self.messages = messages
            .into_iter()
            .map(|message| (message.id.clone(), Arc::new(message)))
            .collect();
        self.cursor = None;
        self.revision += 1;
        Ok(())
    }

    pub(crate) fn set_cursor(&mut self, cursor: StreamingCursor) {
        self.cursor = Some(cursor);
    }

    pub(crate) fn cursor_mut(&mut self) -> Option<&mut StreamingCursor> {
        self.cursor.as_mut()
    }

    /// Clear the cursor, returning the id it pointed at
    pub(crate) fn clear_cursor(&mut self) -> Option<String> {
        self.cursor.take().map(|cursor| cursor.message_id)
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
        self.cursor = None;
        self.revision += 1;
    }
}

impl PartialEq<Vec<Message>> for Transcript {
    fn eq(&self, other: &Vec<Message>) -> bool {
        self.messages.len() == other.len()
            && self.messages.values().zip(other).all(|(a, b)| a.as_ref() == b)
    }
}
