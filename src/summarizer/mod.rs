//! Summarizer abstraction used to compact conversation history
//!
//! The engine only needs "instruction + text in, text out". Providers may
//! fail or hang; callers treat every error as recoverable.

mod openai;

pub use openai::OpenAiSummarizer;

use async_trait::async_trait;

use crate::{Error, Result};

/// Instruction used when compacting raw messages into a layer-1 summary
pub const COMPACT_INSTRUCTION: &str = "Summarize the following conversation. Preserve all \
important information, decisions, constraints, names, numbers, and references. Write it as \
one neutral paragraph.";

/// Instruction used when merging summaries into the next layer
pub const MERGE_INSTRUCTION: &str = "Merge these summaries into a single, more concise summary \
retaining all critical details.";

/// Produces a summary from a system instruction and a block of text
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `content` following `instruction`
    ///
    /// # Errors
    ///
    /// Returns error if the provider is unreachable, times out, or answers
    /// with nothing usable
    async fn summarize(&self, instruction: &str, content: &str) -> Result<String>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Summarizer that always fails
///
/// Used when no provider is configured; every compaction then falls back to
/// truncation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _instruction: &str, _content: &str) -> Result<String> {
        Err(Error::Summarizer("no summarizer configured".to_string()))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_summarizer_always_fails() {
        let result = NoopSummarizer.summarize(COMPACT_INSTRUCTION, "User: hi").await;
        assert!(matches!(result, Err(Error::Summarizer(_))));
    }

    #[test]
    fn instructions_mention_what_to_keep() {
        assert!(COMPACT_INSTRUCTION.contains("decisions"));
        assert!(COMPACT_INSTRUCTION.contains("numbers"));
        assert!(MERGE_INSTRUCTION.contains("critical details"));
    }
}
