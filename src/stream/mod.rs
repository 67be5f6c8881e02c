//! Stream events, wire classification and the interpreter

pub mod events;
pub mod interpreter;
pub mod wire;

pub use events::{MessageDelta, NodeUpdate, StreamEnvelope, StreamEvent, TokenUsage};
pub use interpreter::{Interpreter, InterpreterStats, Transition};
pub use wire::classify;
