//! Context builder for assembling model context from conversation memory

use std::fmt;

use serde::Serialize;

use super::tokens::estimate_tokens;
use crate::Result;
use crate::db::{ConversationRepo, MessageRole};

/// Role of a context message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    System,
    User,
    Assistant,
}

impl ContextRole {
    /// Wire name used by chat completion APIs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageRole> for ContextRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

/// A message in the context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
}

impl ContextMessage {
    fn new(role: ContextRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Built context ready to send to a model
#[derive(Debug, Clone, Serialize)]
pub struct BuiltContext {
    /// System prompt, then summaries, then recent messages
    pub messages: Vec<ContextMessage>,
    /// Summaries included
    pub summary_count: usize,
    /// Raw messages included
    pub recent_count: usize,
    /// Approximate token count of all message contents
    pub estimated_tokens: i64,
}

impl BuiltContext {
    /// Format the context as a single prompt followed by the current message
    #[must_use]
    pub fn format_prompt(&self, current_message: &str) -> String {
        let mut parts: Vec<String> = self
            .messages
            .iter()
            .map(|m| format!("<{}>\n{}\n</{}>", m.role, m.content, m.role))
            .collect();

        parts.push(current_message.to_string());
        parts.join("\n\n")
    }
}

/// Label given to a summary in model context
#[must_use]
pub fn summary_label(layer: u32, text: &str) -> String {
    format!("Conversation summary (layer {layer}): {text}")
}

/// Builds model context from summaries and recent messages
#[derive(Clone)]
pub struct HistoryAssembler {
    repo: ConversationRepo,
}

impl HistoryAssembler {
    /// Create a new history assembler
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(repo: ConversationRepo) -> Self {
        Self { repo }
    }

    /// Assemble the context for the next model call
    ///
    /// Order: the system prompt (if any), every live summary as a system
    /// message (lowest layer first, oldest first within a layer), then the
    /// last `recent_limit` raw messages in chronological order. A
    /// `recent_limit` of zero or less includes every live message.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a database error
    pub fn build_model_context(
        &self,
        conversation_id: &str,
        system_prompt: Option<&str>,
        recent_limit: i64,
    ) -> Result<BuiltContext> {
        self.repo.require_conversation(conversation_id)?;

        let mut messages = Vec::new();

        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(ContextMessage::new(ContextRole::System, prompt));
        }

        let summaries = self.repo.list_summaries(conversation_id)?;
        messages.extend(
            summaries
                .iter()
                .map(|s| {
                    ContextMessage::new(ContextRole::System, summary_label(s.layer, &s.summary_text))
                }),
        );

        let recent = self.repo.get_recent_messages(conversation_id, recent_limit)?;
        let recent_count = recent.len();
        messages.extend(
            recent
                .into_iter()
                .map(|m| ContextMessage::new(m.role.into(), m.content)),
        );

        let estimated_tokens = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        tracing::debug!(
            conversation = conversation_id,
            summaries = summaries.len(),
            recent = recent_count,
            estimated_tokens,
            "built model context"
        );

        Ok(BuiltContext {
            messages,
            summary_count: summaries.len(),
            recent_count,
            estimated_tokens,
        })
    }
}
