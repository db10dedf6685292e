//! Caller-facing conversation memory
//!
//! Wires the repository, summarization engine, and history assembler
//! together behind the operations a chat router needs.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::config::{Config, MemoryConfig};
use crate::context::{
    BuiltContext, CompactionConfig, CompactionOutcome, HistoryAssembler, SummarizationEngine,
};
use crate::db::{self, Conversation, ConversationRepo, DbPool, Message, Summary, infer_title};
use crate::{Error, Result};
use crate::summarizer::{NoopSummarizer, OpenAiSummarizer, Summarizer};

/// Result of recording one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    /// Whether the title was set from this turn
    pub title_updated: bool,
    pub compaction: CompactionOutcome,
}

/// Conversation memory with automatic hierarchical summarization
pub struct ChatMemory {
    repo: ConversationRepo,
    engine: SummarizationEngine,
    assembler: HistoryAssembler,
    config: MemoryConfig,
}

impl ChatMemory {
    /// Create memory over an existing pool
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new(
        pool: DbPool,
        summarizer: Arc<dyn Summarizer>,
        config: MemoryConfig,
    ) -> Result<Self> {
        config.validate()?;

        let repo = ConversationRepo::new(pool);
        let engine =
            SummarizationEngine::new(repo.clone(), summarizer, CompactionConfig::from(&config))?;
        let assembler = HistoryAssembler::new(repo.clone());

        Ok(Self {
            repo,
            engine,
            assembler,
            config,
        })
    }

    /// Open the configured database and pick a summarizer
    ///
    /// Without an API key every compaction uses the truncation fallback.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = db::init(&config.database_path)?;

        let summarizer: Arc<dyn Summarizer> = match &config.summarizer.api_key {
            Some(key) => Arc::new(OpenAiSummarizer::new(key.clone(), &config.summarizer)),
            None => {
                tracing::warn!("no summarizer API key, summaries fall back to truncation");
                Arc::new(NoopSummarizer)
            }
        };
        tracing::debug!(summarizer = summarizer.name(), "summarizer selected");

        Self::new(pool, summarizer, config.memory.clone())
    }

    /// Underlying repository
    #[must_use]
    pub const fn repo(&self) -> &ConversationRepo {
        &self.repo
    }

    /// Memory configuration
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Create a conversation, using the configured limit when none is given
    ///
    /// # Errors
    ///
    /// Returns error if the owner is missing, the limit is invalid, or storage fails
    pub fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
        token_limit: Option<i64>,
    ) -> Result<Conversation> {
        let conversation = self.repo.create_conversation(
            user_id,
            title,
            token_limit.unwrap_or(self.config.token_limit),
        )?;
        tracing::info!(
            conversation = %conversation.id,
            user = user_id,
            limit = conversation.token_limit,
            "conversation created"
        );
        Ok(conversation)
    }

    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.repo.get_conversation(conversation_id)
    }

    /// Conversations of a user, most recently active first
    ///
    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.repo.list_conversations(user_id)
    }

    /// The user's most recent conversation, or a new "General" one
    ///
    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn default_conversation(&self, user_id: &str) -> Result<Conversation> {
        self.repo
            .get_or_create_default(user_id, None, self.config.token_limit)
    }

    /// Append a message pair without summarizing
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a storage error
    pub fn add_message_pair(
        &self,
        conversation_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<(Message, Message)> {
        self.repo
            .append_message_pair(conversation_id, user_content, assistant_content)
    }

    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn get_recent_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        self.repo.get_recent_messages(conversation_id, limit)
    }

    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn list_summaries(&self, conversation_id: &str) -> Result<Vec<Summary>> {
        self.repo.list_summaries(conversation_id)
    }

    /// Compact the conversation if it exceeds `token_limit`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid arguments, or a storage error
    pub async fn summarize_if_needed(
        &self,
        conversation_id: &str,
        token_limit: i64,
        target_ratio: f64,
    ) -> Result<CompactionOutcome> {
        self.engine
            .summarize_if_needed(conversation_id, token_limit, target_ratio)
            .await
    }

    /// Compact against the conversation's own limit and the configured ratio
    ///
    /// # Errors
    ///
    /// Returns error if the conversation does not exist or storage fails
    pub async fn summarize_conversation(&self, conversation_id: &str) -> Result<CompactionOutcome> {
        self.engine.summarize_conversation(conversation_id).await
    }

    /// Assemble model context; `recent_limit` defaults to the configured one
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a storage error
    pub fn build_model_context(
        &self,
        conversation_id: &str,
        system_prompt: Option<&str>,
        recent_limit: Option<i64>,
    ) -> Result<BuiltContext> {
        self.assembler.build_model_context(
            conversation_id,
            system_prompt,
            recent_limit.unwrap_or(self.config.recent_limit),
        )
    }

    /// Record a completed chat turn
    ///
    /// Appends the pair, names a still-untitled conversation after the user
    /// message, then summarizes if the turn pushed it over budget.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a storage error
    pub async fn record_turn(
        &self,
        conversation_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<TurnOutcome> {
        let (user_message, assistant_message) =
            self.repo
                .append_message_pair(conversation_id, user_content, assistant_content)?;

        let title_updated = self
            .repo
            .update_title_if_default(conversation_id, &infer_title(user_content))?;
        if title_updated {
            tracing::debug!(conversation = conversation_id, "title inferred from first message");
        }

        let compaction = self.engine.summarize_conversation(conversation_id).await?;

        Ok(TurnOutcome {
            user_message,
            assistant_message,
            title_updated,
            compaction,
        })
    }

    /// Delete a conversation with its messages and summaries
    ///
    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        self.repo.delete_conversation(conversation_id)
    }

    /// Delete conversations idle longer than the configured number of days
    ///
    /// # Errors
    ///
    /// Returns error if storage fails
    pub fn cleanup_inactive(&self) -> Result<usize> {
        self.cleanup_older_than(self.config.inactive_days)
    }

    /// Delete conversations idle longer than `days`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `days` is out of range, or a storage error
    pub fn cleanup_older_than(&self, days: i64) -> Result<usize> {
        let max_age = Duration::try_days(days)
            .ok_or_else(|| Error::InvalidInput(format!("inactivity age out of range: {days} days")))?;
        let removed = self.repo.cleanup_inactive(max_age)?;
        if removed > 0 {
            tracing::info!(removed, days, "removed inactive conversations");
        }
        Ok(removed)
    }

    /// Recompute the stored token total from live rows
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a storage error
    pub fn recount_totals(&self, conversation_id: &str) -> Result<i64> {
        self.repo.recount_totals(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_limit(token_limit: i64) -> ChatMemory {
        let config = MemoryConfig {
            token_limit,
            ..MemoryConfig::default()
        };
        ChatMemory::new(db::init_memory().unwrap(), Arc::new(NoopSummarizer), config).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = MemoryConfig {
            target_ratio: 2.0,
            ..MemoryConfig::default()
        };
        let result = ChatMemory::new(db::init_memory().unwrap(), Arc::new(NoopSummarizer), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_create_uses_configured_limit() {
        let memory = memory_with_limit(5000);
        let conversation = memory.create_conversation("u", None, None).unwrap();
        assert_eq!(conversation.token_limit, 5000);

        let conversation = memory
            .create_conversation("u", Some("Custom"), Some(42))
            .unwrap();
        assert_eq!(conversation.token_limit, 42);
        assert_eq!(conversation.title, "Custom");
    }

    #[tokio::test]
    async fn test_record_turn_sets_title_once() {
        let memory = memory_with_limit(5000);
        let conversation = memory.create_conversation("u", None, None).unwrap();

        let turn = memory
            .record_turn(&conversation.id, "How do I rotate API keys?", "Like this.")
            .await
            .unwrap();
        assert!(turn.title_updated);

        let turn = memory
            .record_turn(&conversation.id, "Another question", "Another answer")
            .await
            .unwrap();
        assert!(!turn.title_updated);

        let conversation = memory.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(conversation.title, "How do I rotate API keys?");
        assert_eq!(conversation.message_count, 4);
    }

    #[tokio::test]
    async fn test_record_turn_compacts_over_budget() {
        let memory = memory_with_limit(1000);
        let conversation = memory.create_conversation("u", None, None).unwrap();

        // 240 tokens per turn; the fifth crosses the limit
        let mut last = None;
        for _ in 0..5 {
            last = Some(
                memory
                    .record_turn(&conversation.id, &"q".repeat(480), &"a".repeat(480))
                    .await
                    .unwrap(),
            );
        }

        let turn = last.unwrap();
        assert_eq!(turn.compaction.state, crate::context::BudgetState::Balanced);
        assert_eq!(turn.compaction.fallbacks_used, 1);
        assert!(!memory.list_summaries(&conversation.id).unwrap().is_empty());

        let conversation = memory.get_conversation(&conversation.id).unwrap().unwrap();
        assert!(conversation.token_count_total <= 1000);
        assert_eq!(
            conversation.token_count_total,
            memory.repo().live_token_total(&conversation.id).unwrap()
        );
    }

    #[test]
    fn test_default_conversation_is_reused() {
        let memory = memory_with_limit(1000);
        let first = memory.default_conversation("u").unwrap();
        assert_eq!(first.title, "General");
        let second = memory.default_conversation("u").unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_cleanup_keeps_active_conversations() {
        let memory = memory_with_limit(1000);
        memory.create_conversation("u", None, None).unwrap();
        assert_eq!(memory.cleanup_inactive().unwrap(), 0);
        assert_eq!(memory.list_conversations("u").unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_rejects_out_of_range_days() {
        let memory = memory_with_limit(1000);
        memory.create_conversation("u", None, None).unwrap();

        assert!(matches!(memory.cleanup_older_than(i64::MAX), Err(Error::InvalidInput(_))));
        assert!(matches!(memory.cleanup_older_than(100_000_000), Err(Error::InvalidInput(_))));
        assert_eq!(memory.list_conversations("u").unwrap().len(), 1);
    }
}
