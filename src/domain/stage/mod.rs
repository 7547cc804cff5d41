//! Stage aggregate member - domain model and state transitions.
//!
//! - Stage types and states (typestate pattern)
//! - Approve/reject transitions

pub mod state;
pub mod transitions;

pub use state::*;
pub use transitions::{StageAction, rejection_remarks};
