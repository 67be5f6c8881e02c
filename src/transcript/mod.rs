//! Transcript storage

pub mod store;

pub use store::{StreamingCursor, Transcript, TranscriptSnapshot};
