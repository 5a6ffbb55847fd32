use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::PushTokenRow;
use parley_types::events::MessagePayload;
use parley_types::models::{Conversation, ConversationType, UserInfo};
use parley_types::subjects::PushMessageRef;

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com";

/// One notification for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub token: String,
    pub title: String,
    pub body: String,
    pub image: Option<String>,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("push gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivery of a single notification. Retries are the gateway's business.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError>;
}

/// Used when no push credentials are configured.
pub struct NoopGateway;

#[async_trait]
impl PushGateway for NoopGateway {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        debug!(title = %notification.title, "Push disabled, dropping notification");
        Ok(())
    }
}

/// FCM HTTP v1 `messages:send`, authorized with a pre-minted OAuth access token.
pub struct FcmGateway {
    project_id: String,
    access_token: String,
    endpoint: String,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct FcmRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    data: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
}

impl FcmGateway {
    pub fn new(project_id: String, access_token: String) -> Self {
        Self {
            project_id,
            access_token,
            endpoint: FCM_ENDPOINT.to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Point at another FCM-compatible base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.endpoint, self.project_id
        );
        let request = FcmRequest {
            message: FcmMessage {
                token: &notification.token,
                notification: FcmNotification {
                    title: &notification.title,
                    body: &notification.body,
                    image: notification.image.as_deref(),
                },
                data: &notification.data,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(PushError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent: usize,
    pub failed: usize,
}

/// Notification title as seen by `recipient`.
///
/// An explicit conversation title always wins. Otherwise a group is named
/// after all its members and a DM after the other participant.
pub fn resolve_title(conversation: &Conversation, members: &[UserInfo], recipient: Uuid) -> String {
    if !conversation.title.is_empty() {
        return conversation.title.clone();
    }
    match conversation.kind {
        ConversationType::Group => members
            .iter()
            .map(|m| m.full_name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        ConversationType::Dm => members
            .iter()
            .find(|m| m.id != recipient)
            .map(|m| m.full_name.clone())
            .unwrap_or_default(),
    }
}

fn notification_data(conversation: &Conversation, payload: &MessagePayload) -> BTreeMap<String, String> {
    let message = &payload.message;
    let mut data = BTreeMap::new();
    data.insert("conversation_id".to_string(), conversation.id.to_string());
    data.insert("message_id".to_string(), message.id.to_string());
    data.insert("user_id".to_string(), message.user_id.to_string());
    data.insert("type".to_string(), message.kind.clone());
    data.insert("body".to_string(), message.body.clone());
    data.insert(
        "reply_to".to_string(),
        message.reply_to.map(|id| id.to_string()).unwrap_or_default(),
    );
    data.insert(
        "created_at".to_string(),
        message.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    data.insert(
        "updated_at".to_string(),
        message.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    data
}

/// Push a persisted message to every device of every member but the author.
///
/// The reference only carries ids; message, conversation and members are
/// reloaded. A reference without a conversation is logged and dropped.
/// Failures for single tokens are logged and counted, never retried here.
pub async fn handle_push_message(
    db: &Arc<Database>,
    gateway: &dyn PushGateway,
    reference: PushMessageRef,
) -> anyhow::Result<PushReport> {
    if reference.conversation_id.is_none_or(|id| id.is_nil()) {
        warn!(message_id = %reference.id, "Push reference has no conversation, dropping");
        return Ok(PushReport::default());
    }

    let message_id = reference.id;
    let (payload, conversation, members, tokens) = db
        .run(move |db| {
            let payload = db
                .get_message(message_id)?
                .ok_or_else(|| anyhow!("message {} not found", message_id))?;
            let conversation_id = payload.message.conversation_id;
            let conversation = db
                .get_conversation(conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;
            let members = db.list_members(conversation_id)?;

            let mut tokens: Vec<PushTokenRow> = Vec::new();
            for member in members.iter().filter(|m| m.id != payload.message.user_id) {
                match db.list_push_tokens(member.id) {
                    Ok(rows) => tokens.extend(rows),
                    Err(e) => warn!(user_id = %member.id, "Failed to load push tokens: {:#}", e),
                }
            }
            Ok((payload, conversation, members, tokens))
        })
        .await?;

    let data = notification_data(&conversation, &payload);
    let image = Some(conversation.avatar.clone()).filter(|a| !a.is_empty());
    let mut report = PushReport::default();

    for token in tokens {
        let notification = PushNotification {
            title: resolve_title(&conversation, &members, token.user_id),
            body: payload.message.body.clone(),
            image: image.clone(),
            data: data.clone(),
            token: token.token,
        };
        match gateway.send(&notification).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    message_id = %message_id,
                    user_id = %token.user_id,
                    "Failed to send push notification: {}",
                    e
                );
            }
        }
    }

    info!(
        message_id = %message_id,
        conversation_id = %conversation.id,
        sent = report.sent,
        failed = report.failed,
        "Push notifications sent"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn user(name: &str) -> UserInfo {
        UserInfo {
            id: Uuid::new_v4(),
            full_name: name.into(),
            avatar: String::new(),
            kind: "INTERNAL".into(),
        }
    }

    fn conversation(kind: ConversationType, title: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            avatar: String::new(),
            last_message_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn group_title_falls_back_to_member_names() {
        let members = [user("Ada"), user("Bob"), user("Cy")];
        let untitled = conversation(ConversationType::Group, "");
        assert_eq!(resolve_title(&untitled, &members, members[1].id), "Ada, Bob, Cy");

        let titled = conversation(ConversationType::Group, "Lunch");
        assert_eq!(resolve_title(&titled, &members, members[1].id), "Lunch");
    }

    #[test]
    fn dm_title_is_the_other_participant() {
        let members = [user("Ada"), user("Bob")];
        let dm = conversation(ConversationType::Dm, "");
        assert_eq!(resolve_title(&dm, &members, members[0].id), "Bob");
        assert_eq!(resolve_title(&dm, &members, members[1].id), "Ada");

        let titled = conversation(ConversationType::Dm, "Pinned");
        assert_eq!(resolve_title(&titled, &members, members[0].id), "Pinned");
    }
}
