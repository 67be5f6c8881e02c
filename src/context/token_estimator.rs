//! Local token approximation
//!
//! The script-aware estimator is the default: code points from dense scripts
//! (CJK ideographs, kana, hangul, fullwidth forms) carry more tokens per
//! character than everything else, so the two classes get separate ratios.

use crate::config::{EstimatorConfig, EstimatorKind};
use crate::error::{EngineError, Result};
use crate::message::Message;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for one message (content plus tool call arguments)
    fn estimate_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| self.estimate(&c.name) + self.estimate(&c.arguments.to_string()))
            .sum();
        self.estimate(&message.content) + calls
    }

    /// Estimate tokens for a message list
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// Whether a code point belongs to the dense-script class
pub fn is_dense_script(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F     // CJK symbols and punctuation
            | 0x3040..=0x30FF   // hiragana, katakana
            | 0x3400..=0x4DBF   // CJK extension A
            | 0x4E00..=0x9FFF   // CJK unified ideographs
            | 0xAC00..=0xD7AF   // hangul syllables
            | 0xF900..=0xFAFF   // CJK compatibility ideographs
            | 0xFF00..=0xFFEF   // halfwidth and fullwidth forms
            | 0x20000..=0x2FA1F // CJK extensions B-F, compatibility supplement
    )
}

/// Two-class character ratio estimator
#[derive(Debug, Clone, Copy)]
pub struct ScriptAwareEstimator {
    dense_ratio: f64,
    other_ratio: f64,
}

impl ScriptAwareEstimator {
    /// Create with explicit characters-per-token ratios
    pub fn new(dense_ratio: f64, other_ratio: f64) -> Result<Self> {
        if dense_ratio <= 0.0 || other_ratio <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "estimator ratios must be positive: dense={}, other={}",
                dense_ratio, other_ratio
            )));
        }
        Ok(Self {
            dense_ratio,
            other_ratio,
        })
    }

    /// Count (dense, other) code points
    pub fn classify(text: &str) -> (usize, usize) {
        text.chars().fold((0, 0), |(dense, other), c| {
            if is_dense_script(c) {
                (dense + 1, other)
            } else {
                (dense, other + 1)
            }
        })
    }
}

impl Default for ScriptAwareEstimator {
    fn default() -> Self {
        Self {
            dense_ratio: 1.5,
            other_ratio: 4.0,
        }
    }
}

impl TokenEstimator for ScriptAwareEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let (dense, other) = Self::classify(text);
        let tokens = dense as f64 / self.dense_ratio + other as f64 / self.other_ratio;
        tokens.ceil() as usize
    }
}

/// Tiktoken-based token estimator using cl100k_base
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| EngineError::Configuration(format!("tiktoken init failed: {}", e)))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Build the estimator selected by configuration
pub fn build_estimator(config: &EstimatorConfig) -> Result<Arc<dyn TokenEstimator>> {
    match config.kind {
        EstimatorKind::Script => Ok(Arc::new(ScriptAwareEstimator::new(
            config.dense_ratio,
            config.other_ratio,
        )?)),
        EstimatorKind::Tiktoken => Ok(Arc::new(TiktokenEstimator::new()?)),
    }
}
