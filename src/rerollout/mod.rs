//! Regeneration of assistant turns.
//!
//! - [`ToolCallRegistry`]: original → new tool-call ids within one record
//! - [`TurnRegenerator`]: walks a record and rewrites each assistant turn

mod regenerator;
mod registry;

pub use regenerator::{MIN_TEXT_CHARS, TextAttempt, TurnKind, TurnRegenerator, is_valid_text};
pub use registry::ToolCallRegistry;
