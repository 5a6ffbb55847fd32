use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use parley_types::models::UserOnline;

use crate::{Database, OptionalExt};

impl Database {
    /// Record that `connection_id` (a socket in some process) belongs to `user_id`.
    pub fn create_user_online(&self, user_id: Uuid, connection_id: Uuid) -> Result<UserOnline> {
        let entry = UserOnline {
            id: Uuid::now_v7(),
            user_id,
            connection_id,
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_online (id, user_id, connection_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entry.id, entry.user_id, entry.connection_id, entry.created_at],
            )?;
            Ok(())
        })?;
        Ok(entry)
    }

    pub fn get_user_online(&self, id: Uuid) -> Result<Option<UserOnline>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, connection_id, created_at FROM user_online WHERE id = ?1",
                [id],
                user_online_from_row,
            )
            .optional()
        })
    }

    /// Returns whether a row was removed.
    pub fn delete_user_online(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM user_online WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
    }

    /// Every live presence row whose user is a member of the conversation.
    pub fn list_user_online_by_conversation(&self, conversation_id: Uuid) -> Result<Vec<UserOnline>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, connection_id, created_at FROM user_online
                 WHERE user_id IN (
                     SELECT user_id FROM conversation_member WHERE conversation_id = ?1
                 )",
            )?;
            let rows = stmt
                .query_map([conversation_id], user_online_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn user_online_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserOnline> {
    Ok(UserOnline {
        id: row.get(0)?,
        user_id: row.get(1)?,
        connection_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}
