//! Docchat Memory - Conversation memory with hierarchical summarization
//!
//! This library keeps long chat conversations within a token budget:
//! - Persistent conversations, messages, and summaries (`SQLite`)
//! - Budget-driven compaction of old messages into layer-1 summaries
//! - Merging of same-layer summaries into higher layers
//! - Model context assembly from summaries and the recent tail
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   ChatMemory                         │
//! │   record_turn  │  build_model_context  │  cleanup    │
//! └───────┬──────────────────┬──────────────────────────┘
//!         │                  │
//! ┌───────▼────────────┐  ┌──▼─────────────────┐
//! │ SummarizationEngine│  │  HistoryAssembler  │
//! │  compact │ merge   │  │ summaries + recent │
//! └───────┬──────┬─────┘  └──┬─────────────────┘
//!         │      │           │
//!         │  ┌───▼──────┐    │
//!         │  │Summarizer│    │
//!         │  └──────────┘    │
//! ┌───────▼──────────────────▼──────────────────────────┐
//! │              ConversationRepo (SQLite)               │
//! │   conversations  │  messages  │  summaries          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod memory;
pub mod summarizer;

pub use config::{Config, MemoryConfig, SummarizerConfig};
pub use context::{
    BudgetState, BuiltContext, CompactionConfig, CompactionOutcome, ContextMessage, ContextRole,
    HistoryAssembler, SummarizationEngine, estimate_tokens,
};
pub use db::{Conversation, ConversationRepo, DbConn, DbPool, Message, MessageRole, Summary};
pub use error::{Error, Result};
pub use memory::{ChatMemory, TurnOutcome};
pub use summarizer::{NoopSummarizer, OpenAiSummarizer, Summarizer};
