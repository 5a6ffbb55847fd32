use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::MessagePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationType {
    Dm,
    Group,
}

impl ConversationType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "DM",
            Self::Group => "GROUP",
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DM" => Ok(Self::Dm),
            "GROUP" => Ok(Self::Group),
            other => Err(format!("unknown conversation type: {}", other)),
        }
    }
}

/// Public profile of a user, as embedded in message and conversation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub full_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A persisted chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<Uuid>,
    /// Bumped once per committed last-message update.
    #[serde(default)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read watermark for one (user, conversation) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenWatermark {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A live connection's presence row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOnline {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A conversation as listed for one user: its members, its latest message
/// and whether that user has seen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub members: Vec<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default)]
    pub is_read: bool,
}
