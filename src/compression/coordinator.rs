//! Compression coordinator
//!
//! Picks compressible messages, runs one remote batch, and validates the
//! reply before anything touches the transcript. Splicing itself goes
//! through the interpreter so positions never move and a batch is applied
//! whole or not at all.

use super::{CompressionOptions, CompressionService};
use crate::context::TokenEstimator;
use crate::error::{EngineError, Result};
use crate::message::Message;
use crate::metrics::METRICS;
use crate::stream::Interpreter;
use crate::time_operation;
use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one applied batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub compressed: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompressionReport {
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

pub struct CompressionCoordinator {
    service: Arc<dyn CompressionService>,
    estimator: Arc<dyn TokenEstimator>,
    min_length: usize,
}

impl CompressionCoordinator {
    pub fn new(
        service: Arc<dyn CompressionService>,
        estimator: Arc<dyn TokenEstimator>,
        min_length: usize,
    ) -> Self {
        Self {
            service,
            estimator,
            min_length,
        }
    }

    /// Assistant messages of at least `min_length` characters, in transcript
    /// order, excluding the one still streaming
    pub fn select(&self, transcript: &Transcript) -> Vec<String> {
        let streaming = transcript.cursor().map(|c| c.message_id.as_str());
        transcript
            .iter()
            .filter(|m| m.is_assistant())
            .filter(|m| Some(m.id.as_str()) != streaming)
            .filter(|m| m.content.chars().count() >= self.min_length)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Copy out the messages named by `ids`
    pub fn selection(&self, transcript: &Transcript, ids: &[String]) -> Result<Vec<Message>> {
        let streaming = transcript.cursor().map(|c| c.message_id.as_str());
        ids.iter()
            .map(|id| match transcript.get(id) {
                Some(_) if Some(id.as_str()) == streaming => Err(EngineError::InvalidState(
                    format!("message {} is still streaming", id),
                )),
                Some(message) => Ok(message.clone()),
                None => Err(EngineError::InvalidState(format!("unknown message {}", id))),
            })
            .collect()
    }

    /// Run the remote call and return replacement content keyed by id
    ///
    /// The reply must cover exactly the selected ids.
    pub async fn request(
        &self,
        selection: &[Message],
        options: &CompressionOptions,
    ) -> Result<HashMap<String, String>> {
        if selection.is_empty() {
            return Ok(HashMap::new());
        }
        debug!(
            "Compressing {} messages at level {:?}",
            selection.len(),
            options.level
        );

        let result = time_operation!(
            METRICS.remote_call_duration,
            "compression",
            self.service.compress(selection, options).await
        )
        .map_err(|e| match e {
            EngineError::Compression { .. } => e,
            other => EngineError::compression_retriable(other.to_string()),
        })
        .and_then(|reply| Self::validate(selection, reply));

        if let Err(e) = &result {
            warn!("Compression batch rejected: {}", e);
            METRICS.record_compression(false);
        }
        result
    }

    /// Splice replacements and report
    pub fn apply(
        &self,
        interpreter: &mut Interpreter,
        transcript: &mut Transcript,
        selection: &[Message],
        replacements: &HashMap<String, String>,
    ) -> Result<CompressionReport> {
        if replacements.is_empty() {
            return Ok(CompressionReport::default());
        }

        interpreter
            .splice(replacements, transcript)
            .map_err(|e| {
                METRICS.record_compression(false);
                EngineError::compression_retriable(e.to_string())
            })?;

        let report = CompressionReport {
            compressed: replacements.len(),
            tokens_before: self.estimator.estimate_messages(selection),
            tokens_after: replacements
                .values()
                .map(|content| self.estimator.estimate(content))
                .sum(),
        };
        METRICS.record_compression(true);
        info!(
            "Compressed {} messages: {} -> {} estimated tokens",
            report.compressed, report.tokens_before, report.tokens_after
        );
        Ok(report)
    }

    fn validate(selection: &[Message], reply: Vec<Message>) -> Result<HashMap<String, String>> {
        let expected: HashSet<&str> = selection.iter().map(|m| m.id.as_str()).collect();
        let mut replacements = HashMap::with_capacity(reply.len());

        for message in reply {
            if !expected.contains(message.id.as_str()) {
                return Err(EngineError::compression_retriable(format!(
                    "summarizer returned unrequested message {}",
                    message.id
                )));
            }
            replacements.insert(message.id, message.content);
        }

        if replacements.len() != expected.len() {
            return Err(EngineError::compression_retriable(format!(
                "summarizer returned {} of {} messages",
                replacements.len(),
                expected.len()
            )));
        }
        Ok(replacements)
    }
}
