//! Layered configuration: defaults, optional TOML file, environment

use crate::compression::CompressionLevel;
use crate::error::{EngineError, Result};
use crate::transport::StreamMode;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Prefix for layered environment overrides (`CONVERSATION__SECTION__KEY`)
const ENV_PREFIX: &str = "CONVERSATION";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Streaming transport configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Base URL of the completion service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token (read from env CONVERSATION_API_KEY if not set)
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Assistant/graph the runs are created against
    #[serde(default = "default_assistant_id")]
    pub assistant_id: String,

    /// Maximum silence between events before the stream counts as stalled
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Stream modes requested for every run
    #[serde(default = "default_stream_mode")]
    pub stream_mode: Vec<StreamMode>,
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Request timeout in milliseconds
    #[serde(default = "default_checkpoint_timeout_ms")]
    pub timeout_ms: u64,
}

/// Compression service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Summarizer endpoint
    #[serde(default = "default_compression_endpoint")]
    pub endpoint: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_compression_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Minimum content length (characters) for a message to be selected
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    #[serde(default)]
    pub level: CompressionLevel,

    #[serde(default = "default_target_ratio")]
    pub target_ratio: f32,

    #[serde(default = "default_preserve_context")]
    pub preserve_context: bool,
}

/// Which estimator to use for local token approximation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorKind {
    #[default]
    Script,
    Tiktoken,
}

/// Token estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default)]
    pub kind: EstimatorKind,

    /// Dense-script characters per token
    #[serde(default = "default_dense_ratio")]
    pub dense_ratio: f64,

    /// Other characters per token
    #[serde(default = "default_other_ratio")]
    pub other_ratio: f64,

    /// Context window used as the total of an estimated budget
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

/// Session defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Caller identity sent with every run
    #[serde(default)]
    pub caller_id: Option<String>,

    /// Model selected when a submit does not name one
    #[serde(default)]
    pub selected_model: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_base_url() -> String { "http://localhost:2024".to_string() }
fn default_assistant_id() -> String { "agent".to_string() }
fn default_stall_timeout_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_stream_mode() -> Vec<StreamMode> {
    vec![StreamMode::Messages, StreamMode::Updates, StreamMode::Values]
}
fn default_checkpoint_timeout_ms() -> u64 { 10_000 }
fn default_compression_endpoint() -> String { "http://localhost:2024/compress".to_string() }
fn default_compression_timeout_ms() -> u64 { 60_000 }
fn default_max_retries() -> usize { 3 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_min_length() -> usize { 400 }
fn default_target_ratio() -> f32 { 0.5 }
fn default_preserve_context() -> bool { true }
fn default_dense_ratio() -> f64 { 1.5 }
fn default_other_ratio() -> f64 { 4.0 }
fn default_context_window() -> usize { 128_000 }
fn default_log_level() -> String { "info".to_string() }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            assistant_id: default_assistant_id(),
            stall_timeout_ms: default_stall_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stream_mode: default_stream_mode(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_checkpoint_timeout_ms(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_compression_endpoint(),
            timeout_ms: default_compression_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            min_length: default_min_length(),
            level: CompressionLevel::default(),
            target_ratio: default_target_ratio(),
            preserve_context: default_preserve_context(),
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            kind: EstimatorKind::default(),
            dense_ratio: default_dense_ratio(),
            other_ratio: default_other_ratio(),
            context_window: default_context_window(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TransportConfig {
    /// Get stall timeout as Duration
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl CheckpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CompressionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the environment
    ///
    /// `.env` is read first; `CONVERSATION__<SECTION>__<KEY>` variables
    /// override file values, and the well-known short variables are applied
    /// last.
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: Config = builder.build()?.try_deserialize()?;
        let config = config.from_env();
        config.validate()?;

        info!(
            "Configuration loaded: base_url={}, stall_timeout={}ms, estimator={:?}",
            config.transport.base_url, config.transport.stall_timeout_ms, config.estimator.kind
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply well-known environment variables
    pub fn from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("CONVERSATION_BASE_URL") {
            self.transport.base_url = val;
        }

        if let Ok(val) = std::env::var("CONVERSATION_API_KEY") {
            self.transport.api_key = Some(SecretString::new(val));
        }

        if let Ok(val) = std::env::var("CONVERSATION_STALL_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.transport.stall_timeout_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CONVERSATION_COMPRESSION_ENDPOINT") {
            self.compression.endpoint = val;
        }

        if let Ok(val) = std::env::var("CONVERSATION_LOG_JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }

        self
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.transport.base_url.trim().is_empty() {
            return Err(EngineError::Configuration("transport.base_url is empty".to_string()));
        }
        if self.transport.stall_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "transport.stall_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.estimator.dense_ratio <= 0.0 || self.estimator.other_ratio <= 0.0 {
            return Err(EngineError::Configuration(
                "estimator ratios must be positive".to_string(),
            ));
        }
        let ratio = self.compression.target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(EngineError::Configuration(format!(
                "compression.target_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        Ok(())
    }
}
