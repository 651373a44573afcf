//! Pipeline module - dataset rerollout orchestration.

mod rerollout;

pub use rerollout::*;
