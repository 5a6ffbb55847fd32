use std::sync::Arc;

use tracing::info;

use parley_bus::BusClient;
use parley_db::Database;
use parley_types::events::{SeenPayload, WsFrame, WsMessage};
use parley_types::models::SeenWatermark;
use parley_types::subjects::{SeenMessageEvent, Subject};

use crate::publish::BestEffort;

/// Store the watermark and tell the conversation's online members.
///
/// The incoming message id always wins, so a late event for an older
/// message moves the watermark back.
pub async fn handle_seen_message(
    db: &Arc<Database>,
    bus: &BusClient,
    event: SeenMessageEvent,
) -> anyhow::Result<SeenWatermark> {
    let SeenMessageEvent {
        message_id,
        user_id,
        conversation_id,
    } = event;

    let watermark = db
        .run(move |db| db.upsert_seen_message(user_id, conversation_id, message_id))
        .await?;

    let frame = WsMessage::new(WsFrame::SeenMessage(SeenPayload {
        conversation_id,
        message_id,
        user_id,
    }));
    let outcome = BestEffort::new(bus).publish(Subject::NewMessage, &frame).await;

    info!(
        %conversation_id,
        %user_id,
        %message_id,
        announced = outcome.is_published(),
        "Seen watermark updated"
    );
    Ok(watermark)
}
