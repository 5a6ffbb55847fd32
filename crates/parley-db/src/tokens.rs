use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::Database;
use crate::models::PushTokenRow;

impl Database {
    /// Register a device token. Registering the same token again only
    /// refreshes `updated_at`.
    pub fn create_push_token(&self, user_id: Uuid, token: &str) -> Result<()> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fcm_token (id, user_id, token, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (user_id, token) DO UPDATE SET updated_at = excluded.updated_at",
                params![Uuid::new_v4(), user_id, token, now],
            )?;
            Ok(())
        })
    }

    pub fn delete_push_token(&self, user_id: Uuid, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM fcm_token WHERE user_id = ?1 AND token = ?2",
                params![user_id, token],
            )?;
            Ok(n > 0)
        })
    }

    pub fn list_push_tokens(&self, user_id: Uuid) -> Result<Vec<PushTokenRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, token, created_at, updated_at FROM fcm_token
                 WHERE user_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(PushTokenRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        token: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
