//! Durable checkpoint history and reconciliation

pub mod client;
pub mod reconciler;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use client::HttpCheckpointStore;
pub use reconciler::{compare, latest_messages, CheckpointReconciler, ReconcileReport};

/// Source of durable thread history
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Raw checkpoint history for a thread
    ///
    /// Either an ordered array of `{values: {messages: [...]}}` (latest last)
    /// or a flat `{messages: [...]}` document.
    async fn thread_checkpoints(&self, thread_id: &str) -> Result<Value>;
}
