//! Context management for long-running conversations
//!
//! Combines:
//! - Token estimation
//! - Transcript rendering for the summarizer
//! - Budget-driven compaction into layered summaries
//! - Model context assembly (summaries + recent messages)

mod builder;
mod compaction;
mod tokens;
mod transcript;

pub use builder::{BuiltContext, ContextMessage, ContextRole, HistoryAssembler, summary_label};
pub use compaction::{BudgetState, CompactionConfig, CompactionOutcome, SummarizationEngine};
pub use tokens::{CHARS_PER_TOKEN, estimate_tokens, estimate_tokens_opt};
pub use transcript::{
    TranscriptItem, build_transcript, merge_input, message_transcript, truncate_chars,
};
