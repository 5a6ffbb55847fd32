use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use rusqlite::{Connection, Row, TransactionBehavior, params};
use uuid::Uuid;

use parley_types::events::MessagePayload;
use parley_types::models::{Conversation, ConversationType, ConversationView, Message, UserInfo};

use crate::models::{LastMessageUpdate, UserRow};
use crate::{Database, OptionalExt};

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.user_id, m.type, m.body, m.reply_to, \
     m.created_at, m.updated_at, m.deleted_at";

const AUTHOR_COLUMNS: &str = "u.id, u.full_name, u.avatar, u.type";

const CONVERSATION_COLUMNS: &str =
    "c.id, c.type, c.title, c.avatar, c.last_message_id, c.revision, c.created_at, c.updated_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, account_id: &str, full_name: &str, avatar: &str) -> Result<UserRow> {
        let user = UserRow {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            full_name: full_name.to_string(),
            avatar: avatar.to_string(),
            kind: "INTERNAL".to_string(),
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_info (id, account_id, full_name, avatar, type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id,
                    user.account_id,
                    user.full_name,
                    user.avatar,
                    user.kind,
                    user.created_at
                ],
            )?;
            Ok(())
        })?;
        Ok(user)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserInfo>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, full_name, avatar, type FROM user_info u WHERE id = ?1",
                [id],
                user_info_from_row,
            )
            .optional()
        })
    }

    pub fn get_user_id_by_account_id(&self, account_id: &str) -> Result<Option<Uuid>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM user_info WHERE account_id = ?1",
                [account_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// The ids among `ids` that have no user row.
    pub fn missing_users(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM user_info WHERE id = ?1")?;
            let mut missing = Vec::new();
            for id in ids {
                if !stmt.exists([id])? {
                    missing.push(*id);
                }
            }
            Ok(missing)
        })
    }

    // -- Conversations --

    pub fn create_conversation(
        &self,
        kind: ConversationType,
        title: &str,
        avatar: &str,
        member_ids: &[Uuid],
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            kind,
            title: title.to_string(),
            avatar: avatar.to_string(),
            last_message_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversation (id, type, title, avatar, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conversation.id,
                    conversation.kind.as_str(),
                    conversation.title,
                    conversation.avatar,
                    now,
                    now
                ],
            )?;
            for user_id in member_ids {
                tx.execute(
                    "INSERT INTO conversation_member (id, conversation_id, user_id, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![Uuid::new_v4(), conversation.id, user_id, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;

        Ok(conversation)
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Members of a conversation with their profiles.
    pub fn list_members(&self, conversation_id: Uuid) -> Result<Vec<UserInfo>> {
        self.with_conn(|conn| query_members(conn, conversation_id))
    }

    /// The DM between `a` and `b`, if there is one.
    pub fn find_dm(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversation c
                 WHERE c.type = 'DM'
                   AND EXISTS (SELECT 1 FROM conversation_member
                               WHERE conversation_id = c.id AND user_id = ?1)
                   AND EXISTS (SELECT 1 FROM conversation_member
                               WHERE conversation_id = c.id AND user_id = ?2)
                 ORDER BY c.id
                 LIMIT 1"
            );
            conn.query_row(&sql, params![a, b], conversation_from_row).optional()
        })
    }

    /// Conversations of `user_id`, most recently active first.
    ///
    /// Activity is the last message id, or the conversation id while it has
    /// no messages; both are v7 ids. `before` is a cursor on that key.
    pub fn list_conversations(
        &self,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ConversationView>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversation c
                 INNER JOIN conversation_member cm
                    ON cm.conversation_id = c.id AND cm.user_id = ?1
                 WHERE c.deleted_at IS NULL
                   AND (?2 IS NULL OR COALESCE(c.last_message_id, c.id) < ?2)
                 ORDER BY COALESCE(c.last_message_id, c.id) DESC
                 LIMIT ?3"
            );
            let conversations = {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![user_id, before, limit], conversation_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            conversations
                .into_iter()
                .map(|conversation| query_view(conn, user_id, conversation))
                .collect()
        })
    }

    /// One conversation as [`Database::list_conversations`] shows it to `user_id`.
    pub fn get_conversation_view(&self, user_id: Uuid, id: Uuid) -> Result<Option<ConversationView>> {
        self.with_conn(|conn| match query_conversation(conn, id)? {
            Some(conversation) => query_view(conn, user_id, conversation).map(Some),
            None => Ok(None),
        })
    }

    pub fn is_member(&self, user_id: Uuid, conversation_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_member WHERE user_id = ?1 AND conversation_id = ?2",
                    params![user_id, conversation_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Point the conversation at `message_id`.
    ///
    /// Runs in a `BEGIN IMMEDIATE` transaction: the reserved lock is taken
    /// before the conversation row is read, so racing updaters (in this or
    /// any other process sharing the file) commit one after another. The
    /// returned revision is the commit position of this update.
    pub fn update_last_message_id(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<LastMessageUpdate> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let revision: i64 = tx
                .query_row(
                    "SELECT revision FROM conversation WHERE id = ?1",
                    [conversation_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| anyhow!("conversation not found: {}", conversation_id))?;

            let owner: Uuid = tx
                .query_row(
                    "SELECT conversation_id FROM message WHERE id = ?1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| anyhow!("message not found: {}", message_id))?;
            if owner != conversation_id {
                bail!(
                    "message {} belongs to conversation {}, not {}",
                    message_id,
                    owner,
                    conversation_id
                );
            }

            let updated_at = Utc::now();
            let revision = revision + 1;
            tx.execute(
                "UPDATE conversation SET last_message_id = ?1, updated_at = ?2, revision = ?3
                 WHERE id = ?4",
                params![message_id, updated_at, revision, conversation_id],
            )?;
            tx.commit()?;

            Ok(LastMessageUpdate {
                conversation_id,
                message_id,
                revision,
                updated_at,
            })
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO message
                    (id, conversation_id, user_id, type, body, reply_to, created_at, updated_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id,
                    message.conversation_id,
                    message.user_id,
                    message.kind,
                    message.body,
                    message.reply_to,
                    message.created_at,
                    message.updated_at,
                    message.deleted_at
                ],
            )?;
            Ok(())
        })
    }

    /// A message joined with its author's profile.
    pub fn get_message(&self, id: Uuid) -> Result<Option<MessagePayload>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest first. `before` is an id cursor; v7 ids sort by creation time.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}, {AUTHOR_COLUMNS}
                 FROM message m
                 LEFT JOIN user_info u ON m.user_id = u.id
                 WHERE m.conversation_id = ?1 AND (?2 IS NULL OR m.id < ?2)
                 ORDER BY m.id DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![conversation_id, before, limit], message_payload_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversation c WHERE c.id = ?1");
    conn.query_row(&sql, [id], conversation_from_row).optional()
}

fn query_members(conn: &Connection, conversation_id: Uuid) -> Result<Vec<UserInfo>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.full_name, u.avatar, u.type
         FROM conversation_member cm
         INNER JOIN user_info u ON cm.user_id = u.id
         WHERE cm.conversation_id = ?1
         ORDER BY cm.created_at, u.full_name",
    )?;
    let rows = stmt
        .query_map([conversation_id], user_info_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<MessagePayload>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}, {AUTHOR_COLUMNS}
         FROM message m
         LEFT JOIN user_info u ON m.user_id = u.id
         WHERE m.id = ?1"
    );
    conn.query_row(&sql, [id], message_payload_from_row).optional()
}

/// Members, last message and read state of `conversation` for `user_id`.
/// A conversation is read when there is nothing in it, when the user wrote
/// the last message, or when their watermark sits on it.
fn query_view(conn: &Connection, user_id: Uuid, conversation: Conversation) -> Result<ConversationView> {
    let members = query_members(conn, conversation.id)?;
    let last_message = match conversation.last_message_id {
        Some(id) => query_message(conn, id)?,
        None => None,
    };
    let seen: Option<Uuid> = conn
        .query_row(
            "SELECT message_id FROM seen_message WHERE user_id = ?1 AND conversation_id = ?2",
            params![user_id, conversation.id],
            |row| row.get(0),
        )
        .optional()?;

    let is_read = match &last_message {
        None => true,
        Some(last) => last.message.user_id == user_id || seen == Some(last.message.id),
    };

    Ok(ConversationView {
        conversation,
        members,
        last_message,
        is_read,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let kind: String = row.get(1)?;
    let kind = kind.parse::<ConversationType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Conversation {
        id: row.get(0)?,
        kind,
        title: row.get(2)?,
        avatar: row.get(3)?,
        last_message_id: row.get(4)?,
        revision: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn user_info_from_row(row: &Row<'_>) -> rusqlite::Result<UserInfo> {
    Ok(UserInfo {
        id: row.get(0)?,
        full_name: row.get(1)?,
        avatar: row.get(2)?,
        kind: row.get(3)?,
    })
}

fn message_payload_from_row(row: &Row<'_>) -> rusqlite::Result<MessagePayload> {
    let message = Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        kind: row.get(3)?,
        body: row.get(4)?,
        reply_to: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        deleted_at: row.get(8)?,
    };
    // Author columns are NULL when the user row is gone
    let user = match row.get::<_, Option<Uuid>>(9)? {
        Some(id) => Some(UserInfo {
            id,
            full_name: row.get(10)?,
            avatar: row.get(11)?,
            kind: row.get(12)?,
        }),
        None => None,
    };
    Ok(MessagePayload { message, user })
}
