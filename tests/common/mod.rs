//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use docchat_memory::{
    CompactionConfig, ConversationRepo, DbPool, Error, Result, SummarizationEngine, Summarizer, db,
};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Repository over a fresh in-memory database
#[must_use]
pub fn setup_repo() -> ConversationRepo {
    ConversationRepo::new(setup_test_db())
}

/// Engine with default compaction settings
pub fn setup_engine(repo: &ConversationRepo, summarizer: Arc<dyn Summarizer>) -> SummarizationEngine {
    SummarizationEngine::new(repo.clone(), summarizer, CompactionConfig::default())
        .expect("failed to build engine")
}

/// Append `pairs` user/assistant pairs of `chars` characters each
pub fn fill_conversation(repo: &ConversationRepo, conversation_id: &str, pairs: usize, chars: usize) {
    for _ in 0..pairs {
        repo.append_message_pair(conversation_id, &"u".repeat(chars), &"a".repeat(chars))
            .expect("failed to append pair");
    }
}

/// Assert the stored total equals the live sum
pub fn assert_totals_consistent(repo: &ConversationRepo, conversation_id: &str) {
    let conversation = repo
        .require_conversation(conversation_id)
        .expect("conversation exists");
    let live = repo
        .live_token_total(conversation_id)
        .expect("live total");
    assert_eq!(
        conversation.token_count_total, live,
        "stored total must equal the sum of live messages and summaries"
    );
}

/// Summarizer that returns a fixed text and counts calls
pub struct ScriptedSummarizer {
    text: String,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    #[must_use]
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, _instruction: &str, _content: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Summarizer that always errors
pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _instruction: &str, _content: &str) -> Result<String> {
        Err(Error::Summarizer("model unavailable".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
