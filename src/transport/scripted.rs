//! Deterministic in-process transport
//!
//! Each `open_stream` consumes the next queued run. Runs are lists of steps:
//! emitted events, delays, mid-stream failures, or a stream that never ends.
//! Requests are recorded for assertions.

use super::{EventStream, StreamRequest, Transport};
use crate::error::{EngineError, Result};
use crate::stream::{StreamEnvelope, StreamEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One step of a scripted run
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit an event tagged with the run's thread
    Emit(StreamEvent),
    /// Emit an event tagged with some other thread
    EmitFor { thread_id: String, event: StreamEvent },
    Delay(Duration),
    /// Yield an error and end the stream
    Fail(EngineError),
    /// Never yield again
    Hang,
}

impl ScriptStep {
    pub fn delay_ms(ms: u64) -> Self {
        Self::Delay(Duration::from_millis(ms))
    }
}

#[derive(Debug)]
enum ScriptedRun {
    Steps(Vec<ScriptStep>),
    Reject(EngineError),
}

/// Request observed by the transport
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub thread_id: String,
    pub request: StreamRequest,
}

#[derive(Debug, Default)]
struct ScriptState {
    runs: VecDeque<ScriptedRun>,
    requests: Vec<RecordedRequest>,
}

/// Transport replaying queued runs
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run; builder form
    pub fn with_run(self, steps: Vec<ScriptStep>) -> Self {
        self.push_run(steps);
        self
    }

    pub fn push_run(&self, steps: Vec<ScriptStep>) {
        self.lock().runs.push_back(ScriptedRun::Steps(steps));
    }

    /// Queue a run that fails before any event is sent
    pub fn push_rejection(&self, error: EngineError) {
        self.lock().runs.push_back(ScriptedRun::Reject(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Number of opened streams that have since been dropped
    pub fn closed_streams(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a stream as closed when its state is dropped
struct CloseGuard(Arc<AtomicUsize>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct RunState {
    thread_id: String,
    steps: VecDeque<ScriptStep>,
    _guard: CloseGuard,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_stream(&self, thread_id: &str, request: StreamRequest) -> Result<EventStream> {
        let run = {
            let mut state = self.lock();
            state.requests.push(RecordedRequest {
                thread_id: thread_id.to_string(),
                request,
            });
            state.runs.pop_front()
        };

        let steps = match run {
            Some(ScriptedRun::Steps(steps)) => steps,
            Some(ScriptedRun::Reject(error)) => return Err(error),
            None => {
                return Err(EngineError::Transport(
                    "no scripted run left for this request".to_string(),
                ))
            }
        };
        debug!("Scripted run on {} with {} steps", thread_id, steps.len());

        let state = RunState {
            thread_id: thread_id.to_string(),
            steps: steps.into(),
            _guard: CloseGuard(Arc::clone(&self.closed)),
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                match state.steps.pop_front()? {
                    ScriptStep::Emit(event) => {
                        let envelope = StreamEnvelope::new(state.thread_id.clone(), event);
                        return Some((Ok(envelope), state));
                    }
                    ScriptStep::EmitFor { thread_id, event } => {
                        return Some((Ok(StreamEnvelope::new(thread_id, event)), state));
                    }
                    ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Fail(error) => {
                        state.steps.clear();
                        return Some((Err(error), state));
                    }
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
