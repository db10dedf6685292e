//! Conversation repository for CRUD and token bookkeeping
//!
//! Every mutation that changes the live set of messages or summaries also
//! moves `token_count_total` by the same amount, inside one transaction and
//! as an in-store increment.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use uuid::Uuid;

use super::{DbConn, DbPool};
use crate::context::estimate_tokens;
use crate::{Error, Result};

/// Title used when a conversation is created without one
pub const DEFAULT_TITLE: &str = "New Chat";

/// Titles that `update_title_if_default` is allowed to replace
pub const PLACEHOLDER_TITLES: &[&str] = &["", DEFAULT_TITLE];

/// Title given to a user's fallback conversation when nothing better is known
pub const GENERAL_TITLE: &str = "General";

/// Maximum stored title length in characters
pub const TITLE_MAX_CHARS: usize = 100;

const INFERRED_TITLE_CHARS: usize = 50;

/// A chat conversation, the unit of token budgeting
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Budget ceiling for `token_count_total`
    pub token_limit: i64,
    /// Sum of token costs of all live messages and summaries
    pub token_count_total: i64,
    /// Messages ever appended (not decremented by compaction)
    pub message_count: i64,
}

impl Conversation {
    /// Whether the conversation currently exceeds its budget
    #[must_use]
    pub const fn is_over_budget(&self) -> bool {
        self.token_count_total > self.token_limit
    }
}

/// A raw message in a conversation
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Estimated at insertion, never recomputed
    pub token_count: i64,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Capitalized label used in transcripts
    #[must_use]
    pub const fn as_display_str(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A summary standing in for compacted messages or lower-layer summaries
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub id: String,
    pub conversation_id: String,
    /// 1 = compacted from raw messages, N+1 = merged from layer N
    pub layer: u32,
    pub summary_text: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Create a conversation with an empty token account
    ///
    /// # Errors
    ///
    /// Returns error if the owner is missing, the limit is not positive,
    /// or the database operation fails
    pub fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
        token_limit: i64,
    ) -> Result<Conversation> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "conversation requires an owning user".to_string(),
            ));
        }
        if token_limit <= 0 {
            return Err(Error::Config(format!(
                "token limit must be positive, got {token_limit}"
            )));
        }

        let conn = self.conn()?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = format_timestamp(now);
        let title = truncate_title(title.unwrap_or(DEFAULT_TITLE));

        conn.execute(
            "INSERT INTO conversations
                (id, user_id, title, created_at, last_activity, token_limit, token_count_total, message_count)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, 0, 0)",
            params![&id, user_id, &title, &now_str, token_limit],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(conversation = %id, user = user_id, token_limit, "conversation created");

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            title,
            created_at: now,
            last_activity: now,
            token_limit,
            token_count_total: 0,
            message_count: 0,
        })
    }

    /// Get a conversation by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn()?;
        fetch_conversation(&conn, conversation_id)
    }

    /// Get a conversation by id, failing if it does not exist
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown ids, or a database error
    pub fn require_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.get_conversation(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }

    /// List a user's conversations, most recently active first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, title, created_at, last_activity,
                        token_limit, token_count_total, message_count
                 FROM conversations WHERE user_id = ?1
                 ORDER BY last_activity DESC, rowid DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversations = stmt
            .query_map([user_id], conversation_from_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conversations)
    }

    /// Reuse the user's most recently active conversation or start a new one
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_or_create_default(
        &self,
        user_id: &str,
        inferred_title: Option<&str>,
        token_limit: i64,
    ) -> Result<Conversation> {
        if let Some(existing) = self.list_conversations(user_id)?.into_iter().next() {
            return Ok(existing);
        }

        let title = inferred_title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(GENERAL_TITLE);
        self.create_conversation(user_id, Some(title), token_limit)
    }

    /// Delete a conversation together with its messages and summaries
    ///
    /// Returns whether the conversation existed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.execute(
            "DELETE FROM summaries WHERE conversation_id = ?1",
            [conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        let deleted = tx
            .execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        if deleted > 0 {
            tracing::info!(conversation = conversation_id, "conversation deleted");
        }
        Ok(deleted > 0)
    }

    /// Delete conversations with no activity since `now - max_age`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `now - max_age` is not a representable
    /// time, or a database error
    pub fn cleanup_inactive(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now().checked_sub_signed(max_age).ok_or_else(|| {
            Error::InvalidInput(format!("inactivity age out of range: {max_age}"))
        })?;
        let cutoff = format_timestamp(cutoff);

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id IN
                (SELECT id FROM conversations WHERE last_activity < ?1)",
            [&cutoff],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.execute(
            "DELETE FROM summaries WHERE conversation_id IN
                (SELECT id FROM conversations WHERE last_activity < ?1)",
            [&cutoff],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        let deleted = tx
            .execute(
                "DELETE FROM conversations WHERE last_activity < ?1",
                [&cutoff],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        if deleted > 0 {
            tracing::info!(deleted, "cleaned up inactive conversations");
        }
        Ok(deleted)
    }

    /// Append a user message and the assistant reply
    ///
    /// Both inserts and the counter increments commit together.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a database error
    pub fn append_message_pair(
        &self,
        conversation_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<(Message, Message)> {
        let user_tokens = estimate_tokens(user_content);
        let assistant_tokens = estimate_tokens(assistant_content);

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let last_activity: Option<String> = tx
            .query_row(
                "SELECT last_activity FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        let Some(last_activity) = last_activity else {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        };

        // Never before earlier activity, even if the wall clock stepped back
        let step = Duration::microseconds(1);
        let user_at = Utc::now().max(parse_datetime(&last_activity) + step);
        let assistant_at = Utc::now().max(user_at + step);

        let updated = tx
            .execute(
                "UPDATE conversations
                 SET token_count_total = token_count_total + ?1,
                     message_count = message_count + 2,
                     last_activity = ?2
                 WHERE id = ?3",
                params![
                    user_tokens + assistant_tokens,
                    format_timestamp(assistant_at),
                    conversation_id
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        }

        let user = insert_message(
            &tx,
            conversation_id,
            MessageRole::User,
            user_content,
            user_at,
            user_tokens,
        )?;
        let assistant = insert_message(
            &tx,
            conversation_id,
            MessageRole::Assistant,
            assistant_content,
            assistant_at,
            assistant_tokens,
        )?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(
            conversation = conversation_id,
            tokens = user_tokens + assistant_tokens,
            "message pair appended"
        );

        Ok((user, assistant))
    }

    /// Get the most recent `limit` live messages, oldest first
    ///
    /// A `limit` of zero or less returns every live message.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_recent_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn()?;

        if limit <= 0 {
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, content, timestamp, token_count
                     FROM messages WHERE conversation_id = ?1
                     ORDER BY timestamp ASC, rowid ASC",
                )
                .map_err(|e| Error::Database(e.to_string()))?;

            return stmt
                .query_map([conversation_id], message_from_row)
                .map_err(|e| Error::Database(e.to_string()))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::Database(e.to_string()));
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, timestamp, token_count
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut messages = stmt
            .query_map(params![conversation_id, limit], message_from_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    /// Count live messages in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn live_message_count(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Delete messages and release their recorded token cost
    ///
    /// Returns the number of tokens released. Ids that do not belong to the
    /// conversation are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_messages(&self, conversation_id: &str, message_ids: &[String]) -> Result<i64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        let released = delete_items(&tx, Table::Messages, conversation_id, message_ids)?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(released)
    }

    /// Insert a summary and charge its token cost
    ///
    /// The cost is estimated from the text when not supplied.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a database error
    pub fn add_summary(
        &self,
        conversation_id: &str,
        layer: u32,
        text: &str,
        token_count: Option<i64>,
    ) -> Result<Summary> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        let summary = insert_summary(&tx, conversation_id, layer, text, token_count)?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(summary)
    }

    /// List summaries ordered by layer, then creation time
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_summaries(&self, conversation_id: &str) -> Result<Vec<Summary>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, layer, summary_text, token_count, created_at
                 FROM summaries WHERE conversation_id = ?1
                 ORDER BY layer ASC, created_at ASC, rowid ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let summaries = stmt
            .query_map([conversation_id], summary_from_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(summaries)
    }

    /// Delete summaries and release their recorded token cost
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete_summaries(&self, conversation_id: &str, summary_ids: &[String]) -> Result<i64> {
        if summary_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;
        let released = delete_items(&tx, Table::Summaries, conversation_id, summary_ids)?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(released)
    }

    /// Replace raw messages with a layer-1 summary in one transaction
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails; nothing is written then
    pub fn compact_messages(
        &self,
        conversation_id: &str,
        text: &str,
        message_ids: &[String],
    ) -> Result<Summary> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        // Summary first, then the originals
        let summary = insert_summary(&tx, conversation_id, 1, text, None)?;
        delete_items(&tx, Table::Messages, conversation_id, message_ids)?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(summary)
    }

    /// Replace same-layer summaries with one summary at `layer` in one transaction
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails; nothing is written then
    pub fn merge_summaries(
        &self,
        conversation_id: &str,
        layer: u32,
        text: &str,
        summary_ids: &[String],
    ) -> Result<Summary> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let summary = insert_summary(&tx, conversation_id, layer, text, None)?;
        delete_items(&tx, Table::Summaries, conversation_id, summary_ids)?;

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(summary)
    }

    /// Set the title only while it is still a placeholder
    ///
    /// Returns whether the title changed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update_title_if_default(
        &self,
        conversation_id: &str,
        candidate_title: &str,
    ) -> Result<bool> {
        let title = truncate_title(candidate_title.trim());
        if title.is_empty() {
            return Ok(false);
        }

        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE conversations SET title = ?1
                 WHERE id = ?2 AND (title = ?3 OR title = ?4)",
                params![
                    &title,
                    conversation_id,
                    PLACEHOLDER_TITLES[0],
                    PLACEHOLDER_TITLES[1]
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(updated > 0)
    }

    /// Sum of token costs over live messages and summaries
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn live_token_total(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        sum_live_tokens(&conn, conversation_id)
    }

    /// Recompute `token_count_total` from the live rows and store it
    ///
    /// Returns the corrected total.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for unknown conversations, or a database error
    pub fn recount_totals(&self, conversation_id: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let live = sum_live_tokens(&tx, conversation_id)?;
        let previous: Option<i64> = tx
            .query_row(
                "SELECT token_count_total FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        let Some(previous) = previous else {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        };

        tx.execute(
            "UPDATE conversations SET token_count_total = ?1 WHERE id = ?2",
            params![live, conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        if previous != live {
            tracing::warn!(
                conversation = conversation_id,
                previous,
                corrected = live,
                "token total drift reconciled"
            );
        }
        Ok(live)
    }
}

#[derive(Clone, Copy)]
enum Table {
    Messages,
    Summaries,
}

impl Table {
    const fn name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Summaries => "summaries",
        }
    }
}

/// Delete rows by id and decrement the conversation total by their cost
fn delete_items(
    conn: &Connection,
    table: Table,
    conversation_id: &str,
    ids: &[String],
) -> Result<i64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let placeholders = (0..ids.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let bind = std::iter::once(conversation_id).chain(ids.iter().map(String::as_str));

    let released: i64 = conn
        .query_row(
            &format!(
                "SELECT COALESCE(SUM(token_count), 0) FROM {} \
                 WHERE conversation_id = ?1 AND id IN ({placeholders})",
                table.name()
            ),
            params_from_iter(bind.clone()),
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(e.to_string()))?;

    let deleted = conn
        .execute(
            &format!(
                "DELETE FROM {} WHERE conversation_id = ?1 AND id IN ({placeholders})",
                table.name()
            ),
            params_from_iter(bind),
        )
        .map_err(|e| Error::Database(e.to_string()))?;

    conn.execute(
        "UPDATE conversations SET token_count_total = token_count_total - ?1 WHERE id = ?2",
        params![released, conversation_id],
    )
    .map_err(|e| Error::Database(e.to_string()))?;

    tracing::debug!(
        conversation = conversation_id,
        table = table.name(),
        deleted,
        released,
        "items deleted"
    );

    Ok(released)
}

fn insert_message(
    conn: &Connection,
    conversation_id: &str,
    role: MessageRole,
    content: &str,
    timestamp: DateTime<Utc>,
    token_count: i64,
) -> Result<Message> {
    let id = Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO messages (id, conversation_id, role, content, timestamp, token_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &id,
            conversation_id,
            role.as_str(),
            content,
            format_timestamp(timestamp),
            token_count
        ],
    )
    .map_err(|e| Error::Database(e.to_string()))?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        role,
        content: content.to_string(),
        timestamp,
        token_count,
    })
}

fn insert_summary(
    conn: &Connection,
    conversation_id: &str,
    layer: u32,
    text: &str,
    token_count: Option<i64>,
) -> Result<Summary> {
    if layer == 0 {
        return Err(Error::InvalidInput("summary layer must be at least 1".to_string()));
    }

    let token_count = token_count.unwrap_or_else(|| estimate_tokens(text));
    let now = Utc::now();

    let updated = conn
        .execute(
            "UPDATE conversations SET token_count_total = token_count_total + ?1 WHERE id = ?2",
            params![token_count, conversation_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

    if updated == 0 {
        return Err(Error::NotFound(format!("conversation {conversation_id}")));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO summaries (id, conversation_id, layer, summary_text, token_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![&id, conversation_id, layer, text, token_count, format_timestamp(now)],
    )
    .map_err(|e| Error::Database(e.to_string()))?;

    Ok(Summary {
        id,
        conversation_id: conversation_id.to_string(),
        layer,
        summary_text: text.to_string(),
        token_count,
        created_at: now,
    })
}

fn fetch_conversation(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_id, title, created_at, last_activity,
                token_limit, token_count_total, message_count
         FROM conversations WHERE id = ?1",
        [conversation_id],
        conversation_from_row,
    )
    .optional()
    .map_err(|e| Error::Database(e.to_string()))
}

fn sum_live_tokens(conn: &Connection, conversation_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT
            (SELECT COALESCE(SUM(token_count), 0) FROM messages WHERE conversation_id = ?1)
          + (SELECT COALESCE(SUM(token_count), 0) FROM summaries WHERE conversation_id = ?1)",
        [conversation_id],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(e.to_string()))
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        last_activity: parse_datetime(&row.get::<_, String>(4)?),
        token_limit: row.get(5)?,
        token_count_total: row.get(6)?,
        message_count: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: parse_role(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        timestamp: parse_datetime(&row.get::<_, String>(4)?),
        token_count: row.get(5)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<Summary> {
    Ok(Summary {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        layer: row.get(2)?,
        summary_text: row.get(3)?,
        token_count: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

/// Fixed-width UTC timestamps so lexical order matches chronological order
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(
        |e| {
            tracing::warn!(value = s, error = %e, "unparseable stored timestamp, using now");
            Utc::now()
        },
        |dt| dt.with_timezone(&Utc),
    )
}

fn parse_role(s: &str) -> MessageRole {
    MessageRole::from_str(s).unwrap_or_else(|| {
        tracing::warn!(value = s, "unknown stored message role, treating as user");
        MessageRole::User
    })
}

fn truncate_title(title: &str) -> String {
    title.chars().take(TITLE_MAX_CHARS).collect()
}

/// Derive a conversation title from the first user message
#[must_use]
pub fn infer_title(content: &str) -> String {
    let content = content.trim();
    let mut title: String = content.chars().take(INFERRED_TITLE_CHARS).collect();
    title = title.trim_end().to_string();
    if content.chars().count() > INFERRED_TITLE_CHARS {
        title.push_str("...");
    }
    title
}
