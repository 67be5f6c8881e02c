//! Session state and the snapshots published to readers

use crate::context::{TokenBudget, TokenBudgetTracker};
use crate::error::EngineError;
use crate::stream::Interpreter;
use crate::transcript::{Transcript, TranscriptSnapshot};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a turn ended, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// The service paused for a decision; answer with `resume`
    Interrupted,
    /// Cancelled by the caller or superseded by a newer turn
    Cancelled,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Read-only view of a session for the presentation layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub messages: TranscriptSnapshot,
    pub is_loading: bool,
    /// Pending interrupt payload
    pub interrupt: Option<Value>,
    pub token_usage: TokenBudget,
    /// Most recent failure, cleared when the next turn starts
    pub last_error: Option<EngineError>,
    pub thread_id: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn empty(token_usage: TokenBudget) -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            token_usage,
            ..Default::default()
        }
    }
}

/// Mutable session state, guarded by the controller
pub(crate) struct SessionState {
    pub transcript: Transcript,
    pub interpreter: Interpreter,
    pub tracker: TokenBudgetTracker,
    pub pending_interrupt: Option<Value>,
    pub thread_id: Option<String>,
    pub last_error: Option<EngineError>,
    pub is_loading: bool,
}

impl SessionState {
    pub fn new(tracker: TokenBudgetTracker) -> Self {
        Self {
            transcript: Transcript::new(),
            interpreter: Interpreter::new(),
            tracker,
            pending_interrupt: None,
            thread_id: None,
            last_error: None,
            is_loading: false,
        }
    }

    /// Re-estimate the budget and build a snapshot
    pub fn snapshot(&mut self) -> SessionSnapshot {
        let messages = self.transcript.snapshot();
        self.tracker.refresh_estimate(&messages);
        SessionSnapshot {
            messages,
            is_loading: self.is_loading,
            interrupt: self.pending_interrupt.clone(),
            token_usage: self.tracker.current().clone(),
            last_error: self.last_error.clone(),
            thread_id: self.thread_id.clone(),
        }
    }

    /// Forget everything (new session)
    pub fn reset(&mut self) {
        let Self {
            transcript,
            interpreter,
            ..
        } = self;
        interpreter.reset(transcript);
        self.tracker.reset();
        self.pending_interrupt = None;
        self.thread_id = None;
        self.last_error = None;
        self.is_loading = false;
    }
}

/// The turn currently allowed to apply events
#[derive(Debug, Clone)]
pub(crate) struct ActiveTurn {
    pub id: u64,
    pub token: CancellationToken,
}
