//! Session controller
//!
//! Drives turns: opens one stream at a time, feeds its events to the
//! interpreter in delivery order and publishes snapshots after every change.
//!
//! Turn lifecycle:
//! 1. Any running turn is cancelled, then the drive lock is awaited so the
//!    old loop has fully exited before anything of the new turn is applied.
//! 2. The optimistic human message is appended and the stream is opened on
//!    the session's thread (a fresh id when none is fixed yet).
//! 3. Events are applied until `end`, an error, a stall or cancellation.
//!    The token is checked before every read; an event already read is still
//!    applied.
//! 4. The cursor is closed; partial content stays.

use super::state::{ActiveTurn, SessionSnapshot, SessionState, TurnOutcome};
use crate::checkpoint::{CheckpointReconciler, CheckpointStore, HttpCheckpointStore, ReconcileReport};
use crate::compression::{
    CompressionCoordinator, CompressionOptions, CompressionReport, CompressionService,
    HttpCompressionService,
};
use crate::config::Config;
use crate::context::{build_estimator, TokenBudget, TokenBudgetTracker, TokenEstimator};
use crate::error::{EngineError, Result};
use crate::message::Message;
use crate::metrics::METRICS;
use crate::stream::{StreamEnvelope, Transition};
use crate::transcript::TranscriptSnapshot;
use crate::transport::{EventStream, HttpTransport, RunConfig, StreamRequest, Transport};
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session-wide settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Silence after which a stream counts as stalled
    pub stall_timeout: Duration,
    pub context_window: usize,
    pub caller_id: Option<String>,
    /// Used when a run config names no model
    pub selected_model: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            context_window: 128_000,
            caller_id: None,
            selected_model: None,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stall_timeout: config.transport.stall_timeout(),
            context_window: config.estimator.context_window,
            caller_id: config.session.caller_id.clone(),
            selected_model: config.session.selected_model.clone(),
        }
    }
}

/// Owns one conversation session
pub struct SessionController {
    transport: Arc<dyn Transport>,
    reconciler: Option<CheckpointReconciler>,
    compression: Option<CompressionCoordinator>,
    compression_options: CompressionOptions,
    options: SessionOptions,
    state: Mutex<SessionState>,
    active: Mutex<Option<ActiveTurn>>,
    /// Held by the drive loop for the whole turn
    turn_lock: tokio::sync::Mutex<()>,
    next_turn: AtomicU64,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        estimator: Arc<dyn TokenEstimator>,
        options: SessionOptions,
    ) -> Self {
        let tracker = TokenBudgetTracker::new(estimator, options.context_window);
        let (snapshots, _) = watch::channel(SessionSnapshot::empty(tracker.current().clone()));

        Self {
            transport,
            reconciler: None,
            compression: None,
            compression_options: CompressionOptions::default(),
            options,
            state: Mutex::new(SessionState::new(tracker)),
            active: Mutex::new(None),
            turn_lock: tokio::sync::Mutex::new(()),
            next_turn: AtomicU64::new(1),
            snapshots,
        }
    }

    /// Enable `attach` and `verify`
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.reconciler = Some(CheckpointReconciler::new(store));
        self
    }

    /// Enable `compress`
    pub fn with_compression(
        mut self,
        service: Arc<dyn CompressionService>,
        min_length: usize,
        options: CompressionOptions,
    ) -> Self {
        let estimator = Arc::clone(self.lock_state().tracker.estimator());
        self.compression = Some(CompressionCoordinator::new(service, estimator, min_length));
        self.compression_options = options;
        self
    }

    /// Wire HTTP collaborators from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let estimator = build_estimator(&config.estimator)?;
        let transport = Arc::new(HttpTransport::new(&config.transport)?);
        let checkpoints = Arc::new(HttpCheckpointStore::new(&config.transport, &config.checkpoint)?);
        let compression = Arc::new(HttpCompressionService::new(
            &config.compression,
            config.transport.api_key.as_ref(),
        )?);

        Ok(Self::new(transport, estimator, SessionOptions::from_config(config))
            .with_checkpoints(checkpoints)
            .with_compression(
                compression,
                config.compression.min_length,
                CompressionOptions::from(&config.compression),
            ))
    }

    /// Send a human turn and drive its stream to completion
    ///
    /// A turn already running is cancelled first. Cancellation is not an
    /// error: it returns `Ok(TurnOutcome::Cancelled)`.
    pub async fn submit(&self, text: impl Into<String>, config: RunConfig) -> Result<TurnOutcome> {
        let message = Message::human(text);
        let request = StreamRequest {
            input: Some(message.clone()),
            config: self.with_defaults(config),
            resume: None,
            caller: self.options.caller_id.clone(),
        };
        self.run_turn(request, Some(message)).await
    }

    /// Answer a pending interrupt
    ///
    /// The interrupt is cleared when the request is sent, whatever happens
    /// to the turn afterwards.
    pub async fn resume(&self, decision: Value) -> Result<TurnOutcome> {
        let pending = {
            let mut state = self.lock_state();
            let pending = state.pending_interrupt.take();
            if pending.is_some() {
                self.publish(&mut state);
            }
            pending
        };
        if pending.is_none() {
            return Err(EngineError::InvalidState(
                "resume requires a pending interrupt".to_string(),
            ));
        }

        let mut request = StreamRequest::resume(decision, self.with_defaults(RunConfig::default()));
        request.caller = self.options.caller_id.clone();
        self.run_turn(request, None).await
    }

    /// Cancel the running turn, if any; safe to call at any time
    pub fn cancel(&self) {
        if let Some(turn) = self.lock_active().as_ref() {
            if !turn.token.is_cancelled() {
                info!("Cancelling turn {}", turn.id);
                turn.token.cancel();
            }
        }
    }

    /// Reattach to a durable thread and seed the transcript from its history
    ///
    /// The session switches to `thread_id` only once its history is loaded.
    /// On failure the transcript and thread stay as they were and the error
    /// is published.
    pub async fn attach(&self, thread_id: &str) -> Result<usize> {
        let reconciler = self.reconciler.as_ref().ok_or_else(|| {
            EngineError::InvalidState("no checkpoint store configured".to_string())
        })?;

        self.cancel();
        let _drive = self.turn_lock.lock().await;
        {
            let mut state = self.lock_state();
            state.is_loading = true;
            self.publish(&mut state);
        }

        let loaded = reconciler.load(thread_id).await;

        let mut state = self.lock_state();
        state.is_loading = false;
        let seeded = loaded.and_then(|messages| {
            let count = messages.len();
            let SessionState {
                transcript,
                interpreter,
                ..
            } = &mut *state;
            interpreter.seed(messages, transcript).map(|()| count)
        });
        let result = match seeded {
            Ok(count) => {
                state.thread_id = Some(thread_id.to_string());
                state.pending_interrupt = None;
                state.tracker.reset();
                state.last_error = None;
                info!("Attached to thread {} with {} messages", thread_id, count);
                Ok(count)
            }
            Err(e) => {
                warn!("Attach to thread {} failed: {}", thread_id, e);
                state.last_error = Some(e.clone());
                Err(e)
            }
        };
        self.publish(&mut state);
        result
    }

    /// Compare the local transcript with durable history; never repairs
    pub async fn verify(&self) -> Result<ReconcileReport> {
        let reconciler = self.reconciler.as_ref().ok_or_else(|| {
            EngineError::InvalidState("no checkpoint store configured".to_string())
        })?;
        let (thread_id, local) = {
            let state = self.lock_state();
            let thread_id = state.thread_id.clone().ok_or_else(|| {
                EngineError::InvalidState("session has no thread yet".to_string())
            })?;
            (thread_id, state.transcript.to_vec())
        };
        reconciler.verify(&thread_id, &local).await
    }

    /// Drop the transcript, interrupt, budget and thread id
    pub async fn new_session(&self) {
        self.cancel();
        let _drive = self.turn_lock.lock().await;
        let mut state = self.lock_state();
        state.reset();
        self.publish(&mut state);
        info!("Started new session");
    }

    /// Compress messages chosen by the selection policy
    pub async fn compress(&self) -> Result<CompressionReport> {
        let coordinator = self.coordinator()?;
        let ids = coordinator.select(&self.lock_state().transcript);
        self.compress_messages(&ids).await
    }

    /// Compress the named messages as one batch
    pub async fn compress_messages(&self, ids: &[String]) -> Result<CompressionReport> {
        let coordinator = self.coordinator()?;
        let selection = coordinator.selection(&self.lock_state().transcript, ids)?;

        let replacements = match coordinator.request(&selection, &self.compression_options).await {
            Ok(replacements) => replacements,
            Err(e) => {
                let mut state = self.lock_state();
                state.last_error = Some(e.clone());
                self.publish(&mut state);
                return Err(e);
            }
        };

        let mut state = self.lock_state();
        let SessionState {
            transcript,
            interpreter,
            ..
        } = &mut *state;
        let result = coordinator.apply(interpreter, transcript, &selection, &replacements);
        if let Err(e) = &result {
            state.last_error = Some(e.clone());
        }
        self.publish(&mut state);
        result
    }

    /// Receive a snapshot after every change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn messages(&self) -> TranscriptSnapshot {
        self.lock_state().transcript.snapshot()
    }

    pub fn thread_id(&self) -> Option<String> {
        self.lock_state().thread_id.clone()
    }

    pub fn pending_interrupt(&self) -> Option<Value> {
        self.lock_state().pending_interrupt.clone()
    }

    pub fn token_budget(&self) -> TokenBudget {
        self.lock_state().tracker.current().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().is_loading
    }

    async fn run_turn(&self, request: StreamRequest, local: Option<Message>) -> Result<TurnOutcome> {
        let turn = self.begin_turn();
        let _drive = self.turn_lock.lock().await;
        if turn.token.is_cancelled() {
            debug!("Turn {} superseded before it started", turn.id);
            return self.finish_turn(&turn, Err(EngineError::Cancelled));
        }

        let thread_id = {
            let mut state = self.lock_state();
            if let Some(message) = local {
                let SessionState {
                    transcript,
                    interpreter,
                    ..
                } = &mut *state;
                interpreter.append_local(message, transcript);
            }
            state.last_error = None;
            state.is_loading = true;
            let thread_id = state
                .thread_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            self.publish(&mut state);
            thread_id
        };
        info!("Turn {} starting on thread {}", turn.id, thread_id);

        let opened = tokio::select! {
            biased;
            _ = turn.token.cancelled() => return self.finish_turn(&turn, Err(EngineError::Cancelled)),
            opened = self.transport.open_stream(&thread_id, request) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.finish_turn(&turn, Err(e)),
        };

        {
            let mut state = self.lock_state();
            if state.thread_id.is_none() {
                debug!("Thread {} fixed as session identity", thread_id);
                state.thread_id = Some(thread_id.clone());
                self.publish(&mut state);
            }
        }

        let exit = self.drive(&turn, &thread_id, stream).await;
        self.finish_turn(&turn, exit)
    }

    async fn drive(
        &self,
        turn: &ActiveTurn,
        thread_id: &str,
        mut stream: EventStream,
    ) -> Result<()> {
        let stall = self.options.stall_timeout;

        loop {
            if turn.token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let next = tokio::select! {
                biased;
                _ = turn.token.cancelled() => return Err(EngineError::Cancelled),
                next = tokio::time::timeout(stall, stream.next()) => next,
            };

            let envelope = match next {
                Err(_) => {
                    METRICS.stream_stalls.inc();
                    return Err(EngineError::Transport(format!(
                        "stream stalled: no event within {}ms",
                        stall.as_millis()
                    )));
                }
                Ok(None) => {
                    debug!("Stream closed without end event");
                    return Ok(());
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(envelope))) => envelope,
            };

            if self.apply(turn, thread_id, envelope)? {
                return Ok(());
            }
        }
    }

    /// Apply one envelope; `true` ends the loop
    fn apply(&self, turn: &ActiveTurn, thread_id: &str, envelope: StreamEnvelope) -> Result<bool> {
        if !envelope.belongs_to(Some(thread_id)) {
            debug!(
                "Discarding {} event for stale thread {:?}",
                envelope.event.kind(),
                envelope.thread_id
            );
            METRICS.record_dropped("stale");
            return Ok(false);
        }

        let mut state = self.lock_state();
        let SessionState {
            transcript,
            interpreter,
            ..
        } = &mut *state;

        match interpreter.consume(envelope.event, transcript) {
            Transition::Applied => {
                self.publish(&mut state);
                Ok(false)
            }
            Transition::Ignored | Transition::Heartbeat => Ok(false),
            Transition::Interrupt(payload) => {
                info!("Turn {} interrupted, awaiting decision", turn.id);
                state.pending_interrupt = Some(payload);
                self.publish(&mut state);
                Ok(false)
            }
            Transition::TokenUsage(usage) => {
                state.tracker.apply_reported(&usage);
                self.publish(&mut state);
                Ok(false)
            }
            Transition::Failed(cause) => Err(EngineError::Transport(cause)),
            Transition::Rejected(e) => Err(e),
            Transition::Completed => Ok(true),
        }
    }

    fn begin_turn(&self) -> ActiveTurn {
        let turn = ActiveTurn {
            id: self.next_turn.fetch_add(1, Ordering::SeqCst),
            token: CancellationToken::new(),
        };
        let mut active = self.lock_active();
        if let Some(previous) = active.replace(turn.clone()) {
            debug!("Turn {} supersedes turn {}", turn.id, previous.id);
            previous.token.cancel();
        }
        turn
    }

    /// Close the cursor, record the outcome and publish
    fn finish_turn(&self, turn: &ActiveTurn, exit: Result<()>) -> Result<TurnOutcome> {
        {
            let mut active = self.lock_active();
            if active.as_ref().map(|t| t.id) == Some(turn.id) {
                *active = None;
            }
        }

        let mut state = self.lock_state();
        let SessionState {
            transcript,
            interpreter,
            ..
        } = &mut *state;
        interpreter.finalize(transcript);
        debug!("Turn {} interpreter stats: {:?}", turn.id, interpreter.stats());
        state.is_loading = false;

        let result = match exit {
            Ok(()) if state.pending_interrupt.is_some() => Ok(TurnOutcome::Interrupted),
            Ok(()) => Ok(TurnOutcome::Completed),
            Err(e) if e.is_cancelled() => Ok(TurnOutcome::Cancelled),
            Err(e) => {
                error!("Turn {} failed: {}", turn.id, e);
                state.last_error = Some(e.clone());
                Err(e)
            }
        };

        match &result {
            Ok(outcome) => {
                info!("Turn {} {}", turn.id, outcome.as_str());
                METRICS.record_turn(outcome.as_str());
            }
            Err(_) => METRICS.record_turn("failed"),
        }
        self.publish(&mut state);
        result
    }

    fn with_defaults(&self, mut config: RunConfig) -> RunConfig {
        if config.selected_model.is_none() {
            config.selected_model = self.options.selected_model.clone();
        }
        config
    }

    fn coordinator(&self) -> Result<&CompressionCoordinator> {
        self.compression.as_ref().ok_or_else(|| {
            EngineError::InvalidState("no compression service configured".to_string())
        })
    }

    fn publish(&self, state: &mut SessionState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.cancel();
    }
}
