//! CRUD operations for participant records.
//!
//! Participants are owned by the auth collaborator; the store keeps a mirror
//! so conversations and messages can reference them by foreign key.

use chrono::Utc;
use rusqlite::params;

use tandem_shared::{Participant, ParticipantId, Role};

use crate::database::{enum_from_sql, ts_to_sql, uuid_from_sql, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a participant or refresh its role and display name.
    /// Re-activates a previously deactivated participant.
    pub fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO participants (id, role, display_name, is_active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 role = excluded.role,
                 display_name = excluded.display_name,
                 is_active = 1",
            params![
                participant.id.to_string(),
                participant.role.as_str(),
                participant.display_name,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Fetch an active participant. Inactive participants are reported as
    /// [`StoreError::NotFound`].
    pub fn get_participant(&self, id: ParticipantId) -> Result<Participant> {
        self.conn()
            .query_row(
                "SELECT id, role, display_name
                 FROM participants
                 WHERE id = ?1 AND is_active = 1",
                params![id.to_string()],
                row_to_participant,
            )
            .map_err(StoreError::from_query)
    }

    /// Mark a participant inactive. Returns `true` if a row changed.
    pub fn deactivate_participant(&self, id: ParticipantId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE participants SET is_active = 0 WHERE id = ?1 AND is_active = 1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let id_str: String = row.get(0)?;
    let role_str: String = row.get(1)?;
    let display_name: Option<String> = row.get(2)?;

    Ok(Participant {
        id: ParticipantId(uuid_from_sql(0, &id_str)?),
        role: enum_from_sql::<Role>(1, &role_str)?,
        display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let mut p = Participant::new(ParticipantId::new(), Role::Member);
        db.upsert_participant(&p).unwrap();
        assert_eq!(db.get_participant(p.id).unwrap(), p);

        p.display_name = Some("Ada".into());
        db.upsert_participant(&p).unwrap();
        assert_eq!(
            db.get_participant(p.id).unwrap().display_name.as_deref(),
            Some("Ada")
        );
    }

    #[test]
    fn inactive_participant_not_found() {
        let db = Database::open_in_memory().unwrap();
        let p = Participant::new(ParticipantId::new(), Role::Counterpart);
        db.upsert_participant(&p).unwrap();

        assert!(db.deactivate_participant(p.id).unwrap());
        assert!(matches!(db.get_participant(p.id), Err(StoreError::NotFound)));
    }
}
