//! CRUD operations for [`Conversation`] records.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use tandem_shared::{Conversation, ConversationId, ConversationStatus, ParticipantId, Side};

use crate::database::{enum_from_sql, ts_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::{Result, StoreError};

const CONVERSATION_COLUMNS: &str = "id, member_id, counterpart_id, status, member_typing,
     counterpart_typing, last_message_at, last_message_preview, created_at";

/// Key identifying the unordered pair `{a, b}`.
pub fn pair_key(a: ParticipantId, b: ParticipantId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the active conversation for the unordered pair, inserting a new
    /// one if none exists. The boolean is `true` when a row was inserted.
    pub fn create_or_get_conversation(
        &mut self,
        member_id: ParticipantId,
        counterpart_id: ParticipantId,
    ) -> Result<(Conversation, bool)> {
        let key = pair_key(member_id, counterpart_id);
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_active_by_pair(&tx, &key)? {
            tx.commit()?;
            return Ok((existing, false));
        }

        let conversation = Conversation {
            id: ConversationId::new(),
            member_id,
            counterpart_id,
            status: ConversationStatus::Active,
            member_typing: false,
            counterpart_typing: false,
            last_message_at: None,
            last_message_preview: None,
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO conversations (id, member_id, counterpart_id, pair_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.id.to_string(),
                member_id.to_string(),
                counterpart_id.to_string(),
                key,
                conversation.status.as_str(),
                ts_to_sql(&conversation.created_at),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(conversation = %conversation.id, "inserted conversation");
        Ok((conversation, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(StoreError::from_query)
    }

    /// Active conversations the participant takes part in, most recent
    /// activity first.
    pub fn list_active_conversations_for(
        &self,
        participant: ParticipantId,
    ) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             WHERE status = 'active' AND (member_id = ?1 OR counterpart_id = ?1)
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC"
        ))?;

        let rows = stmt.query_map(params![participant.to_string()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Every active conversation, most recent activity first.
    pub fn list_active_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             WHERE status = 'active'
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC"
        ))?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Set the status column and return the updated row.
    pub fn set_conversation_status(
        &self,
        id: ConversationId,
        status: ConversationStatus,
    ) -> Result<Conversation> {
        let affected = self.conn().execute(
            "UPDATE conversations SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_conversation(id)
    }

    /// Toggle the typing flag for one side.
    pub fn set_typing(&self, id: ConversationId, side: Side, is_typing: bool) -> Result<()> {
        let sql = match side {
            Side::Member => "UPDATE conversations SET member_typing = ?2 WHERE id = ?1",
            Side::Counterpart => "UPDATE conversations SET counterpart_typing = ?2 WHERE id = ?1",
        };
        let affected = self
            .conn()
            .execute(sql, params![id.to_string(), is_typing])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn find_active_by_pair(conn: &Connection, key: &str) -> Result<Option<Conversation>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations
                 WHERE pair_key = ?1 AND status = 'active'"
            ),
            params![key],
            row_to_conversation,
        )
        .optional()?;
    Ok(found)
}

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let member_str: String = row.get(1)?;
    let counterpart_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let member_typing: bool = row.get(4)?;
    let counterpart_typing: bool = row.get(5)?;
    let last_at_str: Option<String> = row.get(6)?;
    let last_message_preview: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(Conversation {
        id: ConversationId(uuid_from_sql(0, &id_str)?),
        member_id: ParticipantId(uuid_from_sql(1, &member_str)?),
        counterpart_id: ParticipantId(uuid_from_sql(2, &counterpart_str)?),
        status: enum_from_sql::<ConversationStatus>(3, &status_str)?,
        member_typing,
        counterpart_typing,
        last_message_at: last_at_str.map(|s| ts_from_sql(6, &s)).transpose()?,
        last_message_preview,
        created_at: ts_from_sql(8, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::{Participant, Role};

    fn seeded() -> (Database, ParticipantId, ParticipantId) {
        let db = Database::open_in_memory().unwrap();
        let member = Participant::new(ParticipantId::new(), Role::Member);
        let counterpart = Participant::new(ParticipantId::new(), Role::Counterpart);
        db.upsert_participant(&member).unwrap();
        db.upsert_participant(&counterpart).unwrap();
        (db, member.id, counterpart.id)
    }

    #[test]
    fn create_or_get_is_idempotent() {
        let (mut db, u1, t1) = seeded();

        let (first, created) = db.create_or_get_conversation(u1, t1).unwrap();
        assert!(created);
        let (second, created) = db.create_or_get_conversation(u1, t1).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        // Unordered pair: reversed arguments find the same row.
        let (reversed, created) = db.create_or_get_conversation(t1, u1).unwrap();
        assert!(!created);
        assert_eq!(reversed.id, first.id);
        assert_eq!(db.list_active_conversations().unwrap().len(), 1);
    }

    #[test]
    fn unique_index_rejects_second_active_row() {
        let (mut db, u1, t1) = seeded();
        db.create_or_get_conversation(u1, t1).unwrap();

        let err = db.conn().execute(
            "INSERT INTO conversations (id, member_id, counterpart_id, pair_key, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![
                ConversationId::new().to_string(),
                u1.to_string(),
                t1.to_string(),
                pair_key(t1, u1),
                ts_to_sql(&Utc::now()),
            ],
        );
        assert!(err.is_err());
    }

    #[test]
    fn closed_conversation_allows_a_new_active_one() {
        let (mut db, u1, t1) = seeded();
        let (first, _) = db.create_or_get_conversation(u1, t1).unwrap();
        let closed = db
            .set_conversation_status(first.id, ConversationStatus::Closed)
            .unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);

        let (second, created) = db.create_or_get_conversation(u1, t1).unwrap();
        assert!(created);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn typing_flags_are_per_side() {
        let (mut db, u1, t1) = seeded();
        let (c, _) = db.create_or_get_conversation(u1, t1).unwrap();

        db.set_typing(c.id, Side::Counterpart, true).unwrap();
        let c = db.get_conversation(c.id).unwrap();
        assert!(c.counterpart_typing);
        assert!(!c.member_typing);

        assert!(matches!(
            db.set_typing(ConversationId::new(), Side::Member, true),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_for_participant_only_returns_theirs() {
        let (mut db, u1, t1) = seeded();
        let other = Participant::new(ParticipantId::new(), Role::Member);
        db.upsert_participant(&other).unwrap();

        db.create_or_get_conversation(u1, t1).unwrap();
        db.create_or_get_conversation(other.id, t1).unwrap();

        assert_eq!(db.list_active_conversations_for(u1).unwrap().len(), 1);
        assert_eq!(db.list_active_conversations_for(t1).unwrap().len(), 2);
    }
}
