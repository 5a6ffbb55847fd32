use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_bus::BusClient;
use parley_db::Database;
use parley_types::api::CreateConversationRequest;
use parley_types::events::{MessagePayload, WsFrame, WsMessage};
use parley_types::models::{Conversation, ConversationType, ConversationView, Message, SeenWatermark};
use parley_types::subjects::{PushMessageRef, SeenMessageEvent, Subject, UpdateLastMessageId};

use crate::error::PipelineError;
use crate::publish::{BestEffort, PublishOutcome};

/// Largest page `list_messages` and `list_conversations` return.
const MAX_PAGE: u32 = 100;

/// A conversation and whether this call created it.
#[derive(Debug, Clone)]
pub struct CreatedConversation {
    pub view: ConversationView,
    pub created: bool,
}

/// Input of [`MessagePipeline::send_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: String,
    pub body: String,
    pub reply_to: Option<Uuid>,
    /// Presence id of the socket the sender is typing on. That socket alone
    /// is skipped by fan-out; the sender's other devices still get the frame.
    /// Ignored unless the presence row belongs to the sender.
    pub sender_user_online_id: Option<Uuid>,
}

/// A persisted message and what happened to each of its events.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    pub push: PublishOutcome,
    pub fanout: PublishOutcome,
    pub last_message: PublishOutcome,
}

/// Synchronous entry points: each call is validated and answered here, and
/// the rest of the work is handed to the bus consumers.
#[derive(Clone)]
pub struct MessagePipeline {
    db: Arc<Database>,
    bus: BusClient,
}

impl MessagePipeline {
    pub fn new(db: Arc<Database>, bus: BusClient) -> Self {
        Self { db, bus }
    }

    async fn check_membership(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Conversation, PipelineError> {
        let (conversation, is_member) = self
            .db
            .run(move |db| {
                Ok((
                    db.get_conversation(conversation_id)?,
                    db.is_member(user_id, conversation_id)?,
                ))
            })
            .await
            .map_err(PipelineError::Persistence)?;

        let conversation = conversation.ok_or(PipelineError::NotFound(conversation_id))?;
        if !is_member {
            return Err(PipelineError::NotAMember {
                user_id,
                conversation_id,
            });
        }
        Ok(conversation)
    }

    /// Persist a message, then publish push, fan-out and last-message events.
    ///
    /// Only the membership check and the insert can fail the call. The three
    /// publishes are best effort: the message is returned even if none of
    /// them got out, and the outcome of each is reported in [`SentMessage`].
    pub async fn send_message(&self, input: NewMessage) -> Result<SentMessage, PipelineError> {
        self.check_membership(input.sender_id, input.conversation_id)
            .await?;

        let now = Utc::now();
        let message = Message {
            id: Uuid::now_v7(),
            conversation_id: input.conversation_id,
            user_id: input.sender_id,
            kind: input.kind,
            body: input.body,
            reply_to: input.reply_to,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let row = message.clone();
        self.db
            .run(move |db| db.insert_message(&row))
            .await
            .map_err(PipelineError::Persistence)?;

        let best_effort = BestEffort::new(&self.bus);

        let push = best_effort
            .publish(
                Subject::PushMessage,
                &PushMessageRef {
                    id: message.id,
                    conversation_id: Some(message.conversation_id),
                },
            )
            .await;

        let skip = self
            .sender_socket(input.sender_id, input.sender_user_online_id)
            .await;

        let author_id = message.user_id;
        let fanout = match self.db.run(move |db| db.get_user(author_id)).await {
            Ok(author) => {
                let frame = WsMessage::new(WsFrame::Message(MessagePayload {
                    message: message.clone(),
                    user: author,
                }))
                .ignoring(skip);
                best_effort.publish(Subject::NewMessage, &frame).await
            }
            Err(e) => {
                warn!(message_id = %message.id, "Failed to load author, skipping fan-out: {:#}", e);
                PublishOutcome::Dropped
            }
        };

        let last_message = best_effort
            .publish(
                Subject::UpdateLastMessageId,
                &UpdateLastMessageId {
                    conversation_id: message.conversation_id,
                    message_id: message.id,
                },
            )
            .await;

        info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            user_id = %message.user_id,
            push = push.is_published(),
            fanout = fanout.is_published(),
            last_message = last_message.is_published(),
            "Message sent"
        );

        Ok(SentMessage {
            message,
            push,
            fanout,
            last_message,
        })
    }

    /// Publish a seen event for the seen tracker. Nothing is stored here, so
    /// a publish failure is the caller's error.
    pub async fn seen_message(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> Result<(), PipelineError> {
        self.check_membership(user_id, conversation_id).await?;

        self.bus
            .publish_json(
                Subject::SeenMessage,
                &SeenMessageEvent {
                    message_id,
                    user_id,
                    conversation_id,
                },
            )
            .await?;
        Ok(())
    }

    /// The presence id to leave out of fan-out, if it is one of the
    /// sender's own sockets.
    async fn sender_socket(&self, sender_id: Uuid, user_online_id: Option<Uuid>) -> Option<Uuid> {
        let id = user_online_id?;
        match self.db.run(move |db| db.get_user_online(id)).await {
            Ok(Some(row)) if row.user_id == sender_id => Some(id),
            Ok(Some(row)) => {
                warn!(
                    user_online_id = %id,
                    sender_id = %sender_id,
                    owner_id = %row.user_id,
                    "Sender named another user's socket, delivering to it"
                );
                None
            }
            Ok(None) => {
                debug!(user_online_id = %id, "Sender socket already gone");
                None
            }
            Err(e) => {
                warn!(user_online_id = %id, "Failed to look up sender socket: {:#}", e);
                None
            }
        }
    }

    /// Create a conversation with the caller as a member.
    ///
    /// A DM needs exactly two distinct members and a group at least two.
    /// Asking for a DM that already exists returns it unchanged.
    pub async fn create_conversation(
        &self,
        creator_id: Uuid,
        req: CreateConversationRequest,
    ) -> Result<CreatedConversation, PipelineError> {
        let mut members = vec![creator_id];
        for id in req.members {
            if !members.contains(&id) {
                members.push(id);
            }
        }

        match req.kind {
            ConversationType::Dm if members.len() != 2 => {
                return Err(PipelineError::Invalid(
                    "a DM needs exactly one other member".to_string(),
                ));
            }
            ConversationType::Group if members.len() < 2 => {
                return Err(PipelineError::Invalid(
                    "a group needs at least one other member".to_string(),
                ));
            }
            _ => {}
        }

        let kind = req.kind;
        let (title, avatar) = (req.title, req.avatar);
        let (conversation, created) = self
            .db
            .run(move |db| {
                let missing = db.missing_users(&members)?;
                if !missing.is_empty() {
                    return Ok(Err(missing));
                }
                if kind == ConversationType::Dm {
                    if let Some(existing) = db.find_dm(members[0], members[1])? {
                        return Ok(Ok((existing, false)));
                    }
                }
                let conversation = db.create_conversation(kind, &title, &avatar, &members)?;
                Ok(Ok((conversation, true)))
            })
            .await
            .map_err(PipelineError::Persistence)?
            .map_err(|missing| {
                let ids: Vec<String> = missing.iter().map(Uuid::to_string).collect();
                PipelineError::Invalid(format!("unknown users: {}", ids.join(", ")))
            })?;

        let conversation_id = conversation.id;
        let view = self
            .db
            .run(move |db| db.get_conversation_view(creator_id, conversation_id))
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or(PipelineError::NotFound(conversation_id))?;

        if created {
            info!(
                conversation_id = %conversation_id,
                kind = %kind,
                creator_id = %creator_id,
                members = view.members.len(),
                "Conversation created"
            );
        }
        Ok(CreatedConversation { view, created })
    }

    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ConversationView>, PipelineError> {
        let limit = limit.clamp(1, MAX_PAGE);
        self.db
            .run(move |db| db.list_conversations(user_id, before, limit))
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<ConversationView, PipelineError> {
        self.check_membership(user_id, conversation_id).await?;

        self.db
            .run(move |db| db.get_conversation_view(user_id, conversation_id))
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or(PipelineError::NotFound(conversation_id))
    }

    pub async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, PipelineError> {
        self.check_membership(user_id, conversation_id).await?;

        let limit = limit.clamp(1, MAX_PAGE);
        self.db
            .run(move |db| db.list_messages(conversation_id, before, limit))
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn list_seen(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<SeenWatermark>, PipelineError> {
        self.check_membership(user_id, conversation_id).await?;

        self.db
            .run(move |db| db.list_seen_messages(conversation_id))
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn register_push_token(&self, user_id: Uuid, token: String) -> Result<(), PipelineError> {
        self.db
            .run(move |db| db.create_push_token(user_id, &token))
            .await
            .map_err(PipelineError::Persistence)
    }

    /// Returns whether the token was registered.
    pub async fn delete_push_token(&self, user_id: Uuid, token: String) -> Result<bool, PipelineError> {
        self.db
            .run(move |db| db.delete_push_token(user_id, &token))
            .await
            .map_err(PipelineError::Persistence)
    }
}
