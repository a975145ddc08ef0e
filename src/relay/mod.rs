//! Relay module - turns finalized burns into exactly-once mints
//!
//! Responsibilities:
//! - Filtering delivered events (finality, canonicity, registration, amount)
//! - Recording each qualifying burn once in the action log
//! - Submitting and confirming the compensating mint with bounded retry
//! - Advancing the per-chain cursor only past settled positions

pub mod action;
pub mod engine;
pub mod mapping;
pub mod submitter;


pub use action::{ActionState, ActionTransition, PendingAction};
pub use engine::{Classification, RelayEngine, SkipReason};
pub use mapping::{AddressBook, ScaleFactor, TokenMapping, TokenMappings};
