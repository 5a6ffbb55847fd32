use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Row types that have no wire counterpart in parley-types.

pub struct UserRow {
    pub id: Uuid,
    pub account_id: String,
    pub full_name: String,
    pub avatar: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

pub struct PushTokenRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a committed last-message update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastMessageUpdate {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}
