use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use uuid::Uuid;

use parley_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, conversation_id, content, attachments, timestamp, is_read, is_group";

/// Fixed-width RFC-3339 so that text ordering matches time ordering.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let attachments = serde_json::to_string(&message.attachments)?;
        self.conn().execute(
            "INSERT INTO messages
                (id, sender_id, recipient_id, conversation_id, content, attachments, timestamp, is_read, is_group)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.sender_id.as_str(),
                message.recipient_id,
                message.conversation_id.as_str(),
                message.content,
                attachments,
                format_ts(&message.timestamp),
                message.read,
                message.is_group,
            ],
        )?;
        Ok(())
    }

    /// One page of a conversation in chronological order. `offset` counts
    /// back from the newest message.
    pub fn get_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: Uuid) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], row_to_message)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Flip every unread direct message addressed to `reader` in the
    /// conversation. Returns how many changed; a repeat call returns 0.
    pub fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<usize> {
        let updated = self.conn().execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ?1 AND recipient_id = ?2 AND is_read = 0 AND is_group = 0",
            params![conversation_id.as_str(), reader.as_str()],
        )?;
        Ok(updated)
    }

    /// Unread direct messages addressed to `reader`, across all conversations.
    pub fn unread_count(&self, reader: &UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE recipient_id = ?1 AND is_read = 0 AND is_group = 0",
            params![reader.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient_id: String = row.get(2)?;
    let conversation: String = row.get(3)?;
    let content: String = row.get(4)?;
    let attachments_json: String = row.get(5)?;
    let ts_str: String = row.get(6)?;
    let read: bool = row.get(7)?;
    let is_group: bool = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let attachments: Vec<String> = serde_json::from_str(&attachments_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id,
        sender_id: UserId::from(sender.as_str()),
        recipient_id,
        content,
        conversation_id: ConversationId::from(conversation.as_str()),
        timestamp: parse_ts(6, &ts_str)?,
        read,
        attachments,
        is_group,
    })
}
