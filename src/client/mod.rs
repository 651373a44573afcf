//! Completion client module.

mod completer;
mod llm_client;
mod rate_limiter;

pub use completer::*;
pub use llm_client::*;
pub use rate_limiter::*;
