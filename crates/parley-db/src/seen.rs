use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use parley_types::models::SeenWatermark;

use crate::{Database, OptionalExt};

impl Database {
    /// Set the watermark for (user, conversation) to `message_id`.
    ///
    /// Last write wins: there is no check that `message_id` is newer than the
    /// stored one, so a late event for an older message moves the watermark back.
    pub fn upsert_seen_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<SeenWatermark> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO seen_message (id, message_id, user_id, conversation_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (user_id, conversation_id)
                 DO UPDATE SET message_id = excluded.message_id, updated_at = excluded.updated_at",
                params![Uuid::now_v7(), message_id, user_id, conversation_id, now],
            )?;
            Ok(())
        })?;

        self.get_seen_message(user_id, conversation_id)?
            .ok_or_else(|| anyhow::anyhow!("seen watermark vanished after upsert"))
    }

    pub fn get_seen_message(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Option<SeenWatermark>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, conversation_id, message_id, created_at, updated_at
                 FROM seen_message WHERE user_id = ?1 AND conversation_id = ?2",
                params![user_id, conversation_id],
                |row| {
                    Ok(SeenWatermark {
                        user_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        message_id: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn list_seen_messages(&self, conversation_id: Uuid) -> Result<Vec<SeenWatermark>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, conversation_id, message_id, created_at, updated_at
                 FROM seen_message WHERE conversation_id = ?1",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(SeenWatermark {
                        user_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        message_id: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
