use std::sync::Arc;

use anyhow::anyhow;
use tracing::info;

use parley_bus::BusClient;
use parley_db::Database;
use parley_types::events::{ConversationChanged, WsFrame, WsMessage};
use parley_types::subjects::{Subject, UpdateLastMessageId};

use crate::publish::BestEffort;

/// Move the conversation's last-message pointer and announce the change.
///
/// Racing updates are serialized by the store, so the pointer ends up at
/// whichever update committed last, which is not necessarily the newest
/// message. The announced frame describes this update: its
/// `last_message_id` and `revision` are the ones this call committed, even
/// if a later update has landed by the time the frame is built.
pub async fn handle_update_last_message(
    db: &Arc<Database>,
    bus: &BusClient,
    update: UpdateLastMessageId,
) -> anyhow::Result<ConversationChanged> {
    let UpdateLastMessageId {
        conversation_id,
        message_id,
    } = update;

    let changed = db
        .run(move |db| {
            let committed = db.update_last_message_id(conversation_id, message_id)?;

            let mut conversation = db
                .get_conversation(conversation_id)?
                .ok_or_else(|| anyhow!("conversation {} disappeared", conversation_id))?;
            conversation.last_message_id = Some(committed.message_id);
            conversation.revision = committed.revision;
            conversation.updated_at = committed.updated_at;

            let members = db.list_members(conversation_id)?;
            let last_message = db
                .get_message(message_id)?
                .ok_or_else(|| anyhow!("message {} disappeared", message_id))?;

            Ok(ConversationChanged {
                conversation,
                members,
                last_message,
            })
        })
        .await?;

    let frame = WsMessage::new(WsFrame::UpdateLastMessage(changed.clone()));
    let outcome = BestEffort::new(bus).publish(Subject::NewMessage, &frame).await;

    info!(
        %conversation_id,
        %message_id,
        revision = changed.conversation.revision,
        announced = outcome.is_published(),
        "Last message updated"
    );
    Ok(changed)
}
