//! Deck Actions
//!
//! Action scheduling and button state engine for control-surface buttons.
//! Buttons own ordered action sets; presses run those actions (immediately or
//! after per-action delays) through module instances, and each button's status
//! follows the worst health of the modules it references.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod modules;
pub mod paths;
