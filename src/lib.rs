//! Client-side conversation engine for streaming completion services
//!
//! The engine turns a heterogeneous event stream into a coherent transcript,
//! keeps that transcript consistent with durable checkpoint history, and
//! coordinates cancellation, human-in-the-loop interrupts, compression and
//! token budget tracking.
//!
//! ```no_run
//! use conversation_engine::{Config, RunConfig, SessionController};
//!
//! # async fn run() -> conversation_engine::Result<()> {
//! let config = Config::load(None)?;
//! conversation_engine::logging::init(&config.logging)?;
//!
//! let session = SessionController::from_config(&config)?;
//! let mut updates = session.subscribe();
//! tokio::spawn(async move {
//!     while updates.changed().await.is_ok() {
//!         let snapshot = updates.borrow().clone();
//!         println!("{} messages", snapshot.messages.len());
//!     }
//! });
//!
//! session.submit("Summarize the release notes", RunConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod session;
pub mod stream;
pub mod transcript;
pub mod transport;

pub use checkpoint::{CheckpointReconciler, CheckpointStore, ReconcileReport};
pub use compression::{CompressionLevel, CompressionOptions, CompressionReport, CompressionService};
pub use config::Config;
pub use context::{TokenBudget, TokenEstimator};
pub use error::{EngineError, Result};
pub use message::{Message, Role, ToolCall};
pub use session::{SessionController, SessionOptions, SessionSnapshot, TurnOutcome};
pub use stream::{StreamEnvelope, StreamEvent, TokenUsage};
pub use transcript::Transcript;
pub use transport::{RunConfig, StreamMode, StreamRequest, Transport};
