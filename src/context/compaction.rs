//! Token-budget compaction with layered summaries
//!
//! When a conversation exceeds its token budget, the oldest raw messages are
//! summarized into a layer-1 summary. If that is not enough, the oldest
//! summaries of the lowest layer are merged into the next layer, one merge at
//! a time, until the conversation is back under budget or nothing mergeable
//! is left.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::tokens::{CHARS_PER_TOKEN, estimate_tokens};
use super::transcript::{merge_input, message_transcript, truncate_chars};
use crate::config::{MemoryConfig, validate_budget};
use crate::db::{ConversationRepo, Summary};
use crate::summarizer::{COMPACT_INSTRUCTION, MERGE_INSTRUCTION, Summarizer};
use crate::{Error, Result};

/// Configuration for the summarization engine
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Fraction of the budget to compact down to, in (0, 1]
    pub target_ratio: f64,
    /// Most recent raw messages that are never compacted
    pub preserve_recent_messages: usize,
    /// Transcript characters kept when the summarizer fails
    pub fallback_max_chars: usize,
    /// Timeout for one summarizer call
    pub summarize_timeout: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

impl From<&MemoryConfig> for CompactionConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            target_ratio: config.target_ratio,
            preserve_recent_messages: config.preserve_recent_messages,
            fallback_max_chars: config.fallback_max_chars,
            summarize_timeout: config.summarize_timeout,
        }
    }
}

/// Budget state of a conversation after a summarization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    /// `token_count_total <= token_limit`
    Balanced,
    /// Still over budget; nothing more could be compacted
    OverBudget,
    /// Another pass for this conversation is in flight; nothing was done
    Compacting,
}

/// Result of a summarization pass
#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    pub state: BudgetState,
    pub tokens_before: i64,
    pub tokens_after: i64,
    /// Raw messages replaced by layer-1 summaries
    pub messages_compacted: usize,
    /// Summaries written (layer 1 and merged)
    pub summaries_created: usize,
    /// Lower-layer summaries consumed by merges
    pub summaries_merged: usize,
    /// Summaries produced by the truncation fallback
    pub fallbacks_used: usize,
}

impl CompactionOutcome {
    const fn unchanged(state: BudgetState, tokens: i64) -> Self {
        Self {
            state,
            tokens_before: tokens,
            tokens_after: tokens,
            messages_compacted: 0,
            summaries_created: 0,
            summaries_merged: 0,
            fallbacks_used: 0,
        }
    }

    /// Whether the pass wrote anything
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.summaries_created > 0
    }
}

/// Outcome of a single raw or merge pass
enum Pass {
    Progress,
    NothingToCompact,
}

/// Summarizes old conversation content to keep it within its token budget
pub struct SummarizationEngine {
    repo: ConversationRepo,
    summarizer: Arc<dyn Summarizer>,
    config: CompactionConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl SummarizationEngine {
    /// Create a new engine
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new(
        repo: ConversationRepo,
        summarizer: Arc<dyn Summarizer>,
        config: CompactionConfig,
    ) -> Result<Self> {
        validate_budget(1, config.target_ratio)?;
        if config.fallback_max_chars == 0 {
            return Err(Error::Config(
                "fallback_max_chars must be positive".to_string(),
            ));
        }

        Ok(Self {
            repo,
            summarizer,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Summarize using the conversation's own limit and the configured ratio
    ///
    /// # Errors
    ///
    /// Returns error if the conversation does not exist or storage fails
    pub async fn summarize_conversation(&self, conversation_id: &str) -> Result<CompactionOutcome> {
        let conversation = self.repo.require_conversation(conversation_id)?;
        self.summarize_if_needed(
            conversation_id,
            conversation.token_limit,
            self.config.target_ratio,
        )
        .await
    }

    /// Compact the conversation if it exceeds `token_limit`
    ///
    /// Summarizer failures never surface here; they degrade to truncation.
    /// Staying over budget is reported through the outcome, not as an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid limit or ratio (before any I/O),
    /// `Error::NotFound` for unknown conversations, or a storage error
    pub async fn summarize_if_needed(
        &self,
        conversation_id: &str,
        token_limit: i64,
        target_ratio: f64,
    ) -> Result<CompactionOutcome> {
        validate_budget(token_limit, target_ratio)?;

        let conversation = self.repo.require_conversation(conversation_id)?;
        let tokens_before = conversation.token_count_total;

        if tokens_before <= token_limit {
            tracing::debug!(
                conversation = conversation_id,
                total = tokens_before,
                limit = token_limit,
                "within budget"
            );
            return Ok(CompactionOutcome::unchanged(
                BudgetState::Balanced,
                tokens_before,
            ));
        }

        let Some(_guard) = self.begin(conversation_id) else {
            tracing::debug!(
                conversation = conversation_id,
                "compaction already in flight"
            );
            return Ok(CompactionOutcome::unchanged(
                BudgetState::Compacting,
                tokens_before,
            ));
        };

        let target = target_total(token_limit, target_ratio);
        let mut outcome = CompactionOutcome::unchanged(BudgetState::OverBudget, tokens_before);

        tracing::info!(
            conversation = conversation_id,
            total = tokens_before,
            limit = token_limit,
            target,
            "over budget, compacting"
        );

        // Raw messages first
        if let Pass::NothingToCompact = self
            .compact_messages(conversation_id, tokens_before - target, &mut outcome)
            .await?
        {
            tracing::debug!(conversation = conversation_id, "no raw messages to compact");
        }

        let mut total = self.current_total(conversation_id)?;

        // Each merge removes at least one summary, so this bounds the loop
        let max_merges = self.repo.list_summaries(conversation_id)?.len();
        for _ in 0..max_merges {
            if total <= token_limit {
                break;
            }
            match self
                .merge_lowest_layer(conversation_id, total - target, &mut outcome)
                .await?
            {
                Pass::Progress => total = self.current_total(conversation_id)?,
                Pass::NothingToCompact => break,
            }
        }

        outcome.tokens_after = total;
        outcome.state = if total <= token_limit {
            BudgetState::Balanced
        } else {
            BudgetState::OverBudget
        };

        if outcome.state == BudgetState::OverBudget {
            tracing::warn!(
                conversation = conversation_id,
                total,
                limit = token_limit,
                "conversation remains over budget"
            );
        }

        tracing::info!(
            conversation = conversation_id,
            before = outcome.tokens_before,
            after = outcome.tokens_after,
            compacted = outcome.messages_compacted,
            merged = outcome.summaries_merged,
            fallbacks = outcome.fallbacks_used,
            "compaction finished"
        );

        Ok(outcome)
    }

    /// Replace the oldest raw messages with one layer-1 summary
    async fn compact_messages(
        &self,
        conversation_id: &str,
        reduce_needed: i64,
        outcome: &mut CompactionOutcome,
    ) -> Result<Pass> {
        let messages = self.repo.get_recent_messages(conversation_id, 0)?;
        let compactable = messages
            .len()
            .saturating_sub(self.config.preserve_recent_messages);
        let candidates = &messages[..compactable];

        let (count, batch_tokens) =
            greedy_prefix(candidates.iter().map(|m| m.token_count), reduce_needed);
        if count == 0 || batch_tokens <= 0 {
            return Ok(Pass::NothingToCompact);
        }

        let batch = &candidates[..count];
        tracing::debug!(
            conversation = conversation_id,
            messages = count,
            tokens = batch_tokens,
            reduce_needed,
            "selected messages for compaction"
        );

        let transcript = message_transcript(batch);
        let (text, fell_back) = self
            .summarize_or_truncate(conversation_id, COMPACT_INSTRUCTION, &transcript)
            .await;
        let Some(text) = fit_below(text, batch_tokens) else {
            return Ok(Pass::NothingToCompact);
        };

        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        let summary = self.repo.compact_messages(conversation_id, &text, &ids)?;

        outcome.messages_compacted += count;
        outcome.summaries_created += 1;
        if fell_back {
            outcome.fallbacks_used += 1;
        }

        tracing::info!(
            conversation = conversation_id,
            messages = count,
            released = batch_tokens,
            summary_tokens = summary.token_count,
            "messages compacted into layer 1"
        );

        Ok(Pass::Progress)
    }

    /// Merge the oldest summaries of the lowest layer into the next layer
    async fn merge_lowest_layer(
        &self,
        conversation_id: &str,
        reduce_needed: i64,
        outcome: &mut CompactionOutcome,
    ) -> Result<Pass> {
        let summaries = self.repo.list_summaries(conversation_id)?;
        let Some(layer) = summaries.first().map(|s| s.layer) else {
            return Ok(Pass::NothingToCompact);
        };

        // Sorted by layer, so the lowest layer is a prefix
        let same_layer: Vec<&Summary> = summaries.iter().take_while(|s| s.layer == layer).collect();
        if same_layer.len() < 2 {
            return Ok(Pass::NothingToCompact);
        }

        let (count, _) = greedy_prefix(same_layer.iter().map(|s| s.token_count), reduce_needed);
        // A merge needs at least two inputs
        let count = count.max(2).min(same_layer.len());
        let batch: Vec<Summary> = same_layer[..count].iter().map(|s| (*s).clone()).collect();
        let batch_tokens: i64 = batch.iter().map(|s| s.token_count).sum();
        if batch_tokens <= 0 {
            return Ok(Pass::NothingToCompact);
        }

        tracing::debug!(
            conversation = conversation_id,
            layer,
            summaries = count,
            tokens = batch_tokens,
            reduce_needed,
            "selected summaries for merge"
        );

        let input = merge_input(&batch);
        let (text, fell_back) = self
            .summarize_or_truncate(conversation_id, MERGE_INSTRUCTION, &input)
            .await;
        let Some(text) = fit_below(text, batch_tokens) else {
            return Ok(Pass::NothingToCompact);
        };

        let next_layer = layer.saturating_add(1);
        let ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
        let summary = self
            .repo
            .merge_summaries(conversation_id, next_layer, &text, &ids)?;

        outcome.summaries_merged += count;
        outcome.summaries_created += 1;
        if fell_back {
            outcome.fallbacks_used += 1;
        }

        tracing::info!(
            conversation = conversation_id,
            from_layer = layer,
            to_layer = next_layer,
            merged = count,
            released = batch_tokens,
            summary_tokens = summary.token_count,
            "summaries merged"
        );

        Ok(Pass::Progress)
    }

    /// Call the summarizer, falling back to truncation on any failure
    ///
    /// Returns the text and whether the fallback was used.
    async fn summarize_or_truncate(
        &self,
        conversation_id: &str,
        instruction: &str,
        content: &str,
    ) -> (String, bool) {
        match self.call_summarizer(instruction, content).await {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(
                    conversation = conversation_id,
                    summarizer = self.summarizer.name(),
                    error = %e,
                    "summarizer unavailable, truncating transcript"
                );
                (truncate_chars(content, self.config.fallback_max_chars), true)
            }
        }
    }

    async fn call_summarizer(&self, instruction: &str, content: &str) -> Result<String> {
        let text = tokio::time::timeout(
            self.config.summarize_timeout,
            self.summarizer.summarize(instruction, content),
        )
        .await
        .map_err(|_| Error::Summarizer("summarization timed out".to_string()))??;

        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Summarizer("empty summary".to_string()));
        }
        Ok(text.to_string())
    }

    fn current_total(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .repo
            .require_conversation(conversation_id)?
            .token_count_total)
    }

    /// Mark the conversation as compacting, or `None` if it already is
    fn begin(&self, conversation_id: &str) -> Option<CompactingGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(conversation_id.to_string()) {
            return None;
        }
        Some(CompactingGuard {
            in_flight: &self.in_flight,
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// Clears the compacting mark when a pass ends, including on error
struct CompactingGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    conversation_id: String,
}

impl Drop for CompactingGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.conversation_id);
    }
}

/// `floor(token_limit * target_ratio)`
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]
fn target_total(token_limit: i64, target_ratio: f64) -> i64 {
    (token_limit as f64 * target_ratio).floor() as i64
}

/// Take leading items until their summed cost reaches `needed`
///
/// Returns how many items were taken and their total cost.
fn greedy_prefix<I>(costs: I, needed: i64) -> (usize, i64)
where
    I: IntoIterator<Item = i64>,
{
    let mut count = 0;
    let mut total = 0;
    for cost in costs {
        if count > 0 && total >= needed {
            break;
        }
        count += 1;
        total += cost;
    }
    (count, total)
}

/// Ensure a replacement is strictly cheaper than what it replaces
///
/// Truncates over-long text; `None` when no non-empty text can be cheaper.
fn fit_below(text: String, batch_tokens: i64) -> Option<String> {
    if estimate_tokens(&text) < batch_tokens {
        return Some(text);
    }
    if batch_tokens <= 1 {
        return None;
    }
    let max_chars = usize::try_from(batch_tokens - 1)
        .unwrap_or(usize::MAX)
        .saturating_mul(CHARS_PER_TOKEN);
    Some(truncate_chars(&text, max_chars))
}
