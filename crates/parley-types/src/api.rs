use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ConversationType;

// -- JWT Claims --

/// Bearer token claims. `sub` is the account id; the user id is resolved
/// from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub kind: ConversationType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub avatar: String,
    /// User ids. The caller is added when missing.
    pub members: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    /// Cursor: the `last_message_id` (or id, for a conversation without
    /// messages) of the last entry of the previous page.
    pub before: Option<Uuid>,
    #[serde(default = "default_conversation_limit")]
    pub limit: u32,
}

fn default_conversation_limit() -> u32 {
    20
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: String,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    /// Presence id of the sending socket, suppresses the echo to it.
    #[serde(default)]
    pub user_online_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub conversation_id: Uuid,
    /// Cursor: only messages with an id lower than this one.
    pub before: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

// -- Seen --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeenMessageRequest {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListSeenQuery {
    pub conversation_id: Uuid,
}

// -- Push tokens --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushTokenRequest {
    pub token: String,
}
