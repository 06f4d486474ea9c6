use rusqlite::{params, OptionalExtension, TransactionBehavior};

use tandem_shared::{
    preview, AttachmentRef, ConversationId, Message, MessageId, MessageKind, ParticipantId,
};

use crate::database::{enum_from_sql, ts_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, content, kind,
     is_read, attachment_url, attachment_name, created_at";

impl Database {
    /// Insert a message and update the owning conversation's last-message
    /// columns in one transaction.
    pub fn insert_message(&mut self, message: &Message) -> Result<()> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let created_at = ts_to_sql(&message.created_at);

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, kind,
                                   is_read, attachment_url, attachment_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id.to_string(),
                message.receiver_id.to_string(),
                message.content,
                message.kind.as_str(),
                message.is_read,
                message.attachment.as_ref().map(|a| a.url.as_str()),
                message.attachment.as_ref().map(|a| a.name.as_str()),
                created_at,
            ],
        )?;

        let affected = tx.execute(
            "UPDATE conversations
             SET last_message_at = ?2, last_message_preview = ?3
             WHERE id = ?1",
            params![
                message.conversation_id.to_string(),
                created_at,
                preview(&message.content),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        tx.commit()?;
        Ok(())
    }

    /// Messages of a conversation in creation order. With a `limit`, only the
    /// most recent `limit` messages are returned (still oldest first).
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS}, rowid AS seq
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?2
             )
             ORDER BY created_at ASC, seq ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id.to_string(), limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.find_message(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(found)
    }

    /// Set `is_read`. Returns `true` only if the flag flipped; the flag never
    /// goes back to false.
    pub fn mark_message_read(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1 AND is_read = 0",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Mark every unread message addressed to `receiver` in the conversation.
    /// Returns the ids that flipped.
    pub fn mark_conversation_read(
        &mut self,
        conversation_id: ConversationId,
        receiver: ParticipantId,
    ) -> Result<Vec<MessageId>> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), receiver.to_string()],
                |row| {
                    let s: String = row.get(0)?;
                    uuid_from_sql(0, &s).map(MessageId)
                },
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        tx.execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![conversation_id.to_string(), receiver.to_string()],
        )?;
        tx.commit()?;

        Ok(ids)
    }

    /// Unread messages addressed to `receiver` across all conversations.
    pub fn count_unread(&self, receiver: ParticipantId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
            params![receiver.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let receiver_str: String = row.get(3)?;
    let content: String = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let is_read: bool = row.get(6)?;
    let attachment_url: Option<String> = row.get(7)?;
    let attachment_name: Option<String> = row.get(8)?;
    let ts_str: String = row.get(9)?;

    let attachment = match (attachment_url, attachment_name) {
        (Some(url), Some(name)) => Some(AttachmentRef { url, name }),
        _ => None,
    };

    Ok(Message {
        id: MessageId(uuid_from_sql(0, &id_str)?),
        conversation_id: ConversationId(uuid_from_sql(1, &conversation_str)?),
        sender_id: ParticipantId(uuid_from_sql(2, &sender_str)?),
        receiver_id: ParticipantId(uuid_from_sql(3, &receiver_str)?),
        content,
        kind: enum_from_sql::<MessageKind>(5, &kind_str)?,
        is_read,
        attachment,
        created_at: ts_from_sql(9, &ts_str)?,
    })
}
