use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker subjects used by the distribution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Fan-out class frames (new message, conversation changed, seen changed).
    NewMessage,
    UpdateLastMessageId,
    SeenMessage,
    PushMessage,
}

impl Subject {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "ws_message.new",
            Self::UpdateLastMessageId => "conversation.update_last_message_id",
            Self::SeenMessage => "conversation.seen_message",
            Self::PushMessage => "fcm.message",
        }
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// Durable consumer names
pub const CONSUMER_WS_MESSAGE_NEW: &str = "ws_message_new_consumer";
pub const CONSUMER_UPDATE_LAST_MESSAGE: &str = "ws_message_update_last_message_consumer";
pub const CONSUMER_SEEN_MESSAGE: &str = "seen_message_consumer";
pub const CONSUMER_FCM_MESSAGE: &str = "fcm_message_consumer";

// Queue groups
pub const QUEUE_UPDATE_LAST_MESSAGE: &str = "ws_message_update_last_message_queue";
pub const QUEUE_SEEN_MESSAGE: &str = "seen_message_queue";
pub const QUEUE_FCM_MESSAGE: &str = "fcm_message_queue";

/// Payload of `conversation.update_last_message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLastMessageId {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}

/// Payload of `conversation.seen_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenMessageEvent {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
}

/// Payload of `fcm.message`: a reference to a persisted message. The push
/// notifier reloads everything else from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessageRef {
    pub id: Uuid,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}
