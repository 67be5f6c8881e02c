//! Transcript compression through a remote summarizer

pub mod client;
pub mod coordinator;

use crate::config::CompressionConfig;
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::HttpCompressionService;
pub use coordinator::{CompressionCoordinator, CompressionReport};

/// How hard the summarizer should squeeze
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Light,
    #[default]
    Medium,
    Aggressive,
}

/// Options sent with every compression batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionOptions {
    pub level: CompressionLevel,
    pub preserve_context: bool,
    /// Desired output/input length ratio in (0, 1]
    pub target_ratio: f32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            preserve_context: true,
            target_ratio: 0.5,
        }
    }
}

impl From<&CompressionConfig> for CompressionOptions {
    fn from(config: &CompressionConfig) -> Self {
        Self {
            level: config.level,
            preserve_context: config.preserve_context,
            target_ratio: config.target_ratio,
        }
    }
}

/// Remote summarizer
#[async_trait]
pub trait CompressionService: Send + Sync {
    /// Compress `messages`; the result carries replacement content keyed by
    /// the original ids
    async fn compress(
        &self,
        messages: &[Message],
        options: &CompressionOptions,
    ) -> Result<Vec<Message>>;
}
