//! Session lifecycle: turns, cancellation, interrupts and reattach

pub mod controller;
pub mod state;

pub use controller::{SessionController, SessionOptions};
pub use state::{SessionSnapshot, TurnOutcome};
