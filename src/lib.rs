//! reroll - Regenerate the assistant turns of tool-calling datasets.
//!
//! ## Architecture
//!
//! - **Completion Client**: OpenAI-compatible chat completions with retry and shared backoff
//! - **Turn Regenerator**: Rewrites each assistant turn, keeping the tool-call skeleton
//! - **Record Orchestrator**: Bounded concurrent regeneration, one output line per record
//!
//! ## Pipeline
//!
//! Input JSONL → Resume filter → Regenerate turns → Remap tool ids → Output JSONL
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff, turn fallback)

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod rerollout;

// Re-exports for convenience
pub use checkpoint::{OutputWriter, load_processed_ids};
pub use client::{ChatCompleter, LLMClient, RateLimiter};
pub use models::{Config, Record, RerollError, Result, RunSummary, TokenStats};
pub use pipeline::{RerolloutPipeline, default_output_path};
pub use rerollout::{ToolCallRegistry, TurnRegenerator};
