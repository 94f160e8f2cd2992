//! Take sessions

pub mod manager;
pub mod state;

pub use manager::{AppendOutcome, TakeSessionManager, TakeStatusReport};
pub use state::{can_transition, StateTransition, TakeSession};
