use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Conversation, Message, UserInfo};

pub const WS_AUTHORIZATION: &str = "AUTHORIZATION";
pub const WS_MESSAGE: &str = "MESSAGE";
pub const WS_PING: &str = "PING";
pub const WS_PONG: &str = "PONG";
pub const WS_UPDATE_LAST_MESSAGE: &str = "UPDATE_LAST_MESSAGE";
pub const WS_SEEN_MESSAGE: &str = "SEEN_MESSAGE";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Frames exchanged over the websocket and carried on the fan-out subject.
///
/// Decoding reads the `type` tag first and then parses `payload` into the
/// matching variant. Unrecognised tags land in `Unknown` with the payload
/// kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    Authorization(AuthorizationPayload),
    Message(MessagePayload),
    Ping,
    Pong,
    UpdateLastMessage(ConversationChanged),
    SeenMessage(SeenPayload),
    Unknown { kind: String, payload: Value },
}

impl WsFrame {
    pub fn kind(&self) -> &str {
        match self {
            Self::Authorization(_) => WS_AUTHORIZATION,
            Self::Message(_) => WS_MESSAGE,
            Self::Ping => WS_PING,
            Self::Pong => WS_PONG,
            Self::UpdateLastMessage(_) => WS_UPDATE_LAST_MESSAGE,
            Self::SeenMessage(_) => WS_SEEN_MESSAGE,
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Conversation the frame is scoped to. Frames returning `None` have no
    /// fan-out audience.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::Message(p) => Some(p.message.conversation_id),
            Self::UpdateLastMessage(p) => Some(p.conversation.id),
            Self::SeenMessage(p) => Some(p.conversation_id),
            _ => None,
        }
    }
}

/// Wire envelope: `{"type": .., "payload": {..}, "ignore_user_onlines": [..]}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Envelope")]
pub struct WsMessage {
    pub frame: WsFrame,
    /// Presence ids that must not receive this frame during fan-out.
    pub ignore_user_onlines: Vec<Uuid>,
}

impl WsMessage {
    pub fn new(frame: WsFrame) -> Self {
        Self {
            frame,
            ignore_user_onlines: Vec::new(),
        }
    }

    pub fn ignoring(mut self, user_online_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.ignore_user_onlines.extend(user_online_ids);
        self
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Self::try_from(Envelope::decode(text)?)
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The envelope with its payload left as raw JSON.
///
/// Only the shape of the envelope itself is checked, so a frame decodes
/// whatever its payload looks like. Client frames are read this way;
/// [`WsMessage`] adds the typed payload on top.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ignore_user_onlines: Vec<Uuid>,
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Non-empty `payload.token`, as sent by a client authorizing.
    pub fn token(&self) -> Option<&str> {
        self.payload
            .get("token")
            .and_then(Value::as_str)
            .filter(|token| !token.trim().is_empty())
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

impl TryFrom<Envelope> for WsMessage {
    type Error = DecodeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope {
            kind,
            payload: value,
            ignore_user_onlines,
        } = envelope;

        let frame = match kind.as_str() {
            WS_AUTHORIZATION => WsFrame::Authorization(payload(&kind, value)?),
            WS_MESSAGE => WsFrame::Message(payload(&kind, value)?),
            WS_PING => WsFrame::Ping,
            WS_PONG => WsFrame::Pong,
            WS_UPDATE_LAST_MESSAGE => WsFrame::UpdateLastMessage(payload(&kind, value)?),
            WS_SEEN_MESSAGE => WsFrame::SeenMessage(payload(&kind, value)?),
            _ => WsFrame::Unknown {
                kind,
                payload: value,
            },
        };

        Ok(Self {
            frame,
            ignore_user_onlines,
        })
    }
}

impl Serialize for WsMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.frame.kind())?;
        match &self.frame {
            WsFrame::Authorization(p) => map.serialize_entry("payload", p)?,
            WsFrame::Message(p) => map.serialize_entry("payload", p)?,
            WsFrame::UpdateLastMessage(p) => map.serialize_entry("payload", p)?,
            WsFrame::SeenMessage(p) => map.serialize_entry("payload", p)?,
            WsFrame::Unknown { payload, .. } if !payload.is_null() => {
                map.serialize_entry("payload", payload)?
            }
            WsFrame::Ping | WsFrame::Pong | WsFrame::Unknown { .. } => {}
        }
        if !self.ignore_user_onlines.is_empty() {
            map.serialize_entry("ignore_user_onlines", &self.ignore_user_onlines)?;
        }
        map.end()
    }
}

/// AUTHORIZATION carries the bearer token client-side and the resolved
/// identity in the server's acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthorizationPayload {
    Granted(AuthorizationGranted),
    Request { token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationGranted {
    pub account_id: String,
    pub user_id: Uuid,
    pub user_online_id: Uuid,
}

/// A new message enriched with its author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// "Conversation changed": the conversation after a last-message update,
/// with its members and the message the pointer now references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationChanged {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub members: Vec<UserInfo>,
    pub last_message: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenPayload {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
}
