//! Canonical messages and the normalization boundary

pub mod models;
pub mod normalizer;

pub use models::{Message, Role, ToolCall};
pub use normalizer::{normalize_message, normalize_messages, normalize_role};
