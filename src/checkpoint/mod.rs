//! Output module for resumable runs.
//!
//! Provides:
//! - `OutputWriter`: Serialized JSONL appends shared by every task
//! - `load_processed_ids`: Ids already written, the resume checkpoint

mod writer;

pub use writer::*;
