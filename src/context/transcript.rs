//! Transcript rendering for summarizer input

use crate::db::{Message, MessageRole, Summary};

/// One entry of a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptItem<'a> {
    /// A raw chat message
    Message { role: MessageRole, content: &'a str },
    /// A previously produced summary
    Summary { layer: u32, text: &'a str },
}

impl<'a> From<&'a Message> for TranscriptItem<'a> {
    fn from(message: &'a Message) -> Self {
        Self::Message {
            role: message.role,
            content: &message.content,
        }
    }
}

impl<'a> From<&'a Summary> for TranscriptItem<'a> {
    fn from(summary: &'a Summary) -> Self {
        Self::Summary {
            layer: summary.layer,
            text: &summary.summary_text,
        }
    }
}

impl TranscriptItem<'_> {
    fn render(&self) -> String {
        match self {
            Self::Message { role, content } => format!("{}: {content}", role.as_display_str()),
            Self::Summary { layer, text } => format!("Summary (layer {layer}): {text}"),
        }
    }
}

/// Render items as `Role: content` lines, preserving input order
#[must_use]
pub fn build_transcript<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = TranscriptItem<'a>>,
{
    items
        .into_iter()
        .map(|item| item.render())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a batch of messages, oldest first
#[must_use]
pub fn message_transcript(messages: &[Message]) -> String {
    build_transcript(messages.iter().map(TranscriptItem::from))
}

/// Concatenate summary texts separated by a blank line
#[must_use]
pub fn merge_input(summaries: &[Summary]) -> String {
    summaries
        .iter()
        .map(|s| s.summary_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep at most `max_chars` characters of `text`
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
