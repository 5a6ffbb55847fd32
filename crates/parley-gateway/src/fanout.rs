use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use parley_bus::{BusClient, BusError, Delivery, Subscription};
use parley_db::Database;
use parley_types::events::WsMessage;
use parley_types::subjects::{CONSUMER_WS_MESSAGE_NEW, Subject};

use crate::registry::ConnectionRegistry;

/// Outcome of pushing one frame to a conversation's online members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Presence rows of the conversation, after the ignore-list.
    pub audience: usize,
    pub delivered: usize,
    /// Presence rows whose socket lives on another process, or is gone.
    pub skipped_offline: usize,
    pub failed: usize,
}

/// Push `message` to every socket of this process that belongs to a member
/// of the frame's conversation.
///
/// Only audience resolution can fail. Per-socket send errors are counted
/// and logged; a socket that already got this frame gets it again on a
/// redelivery.
pub async fn fan_out(
    db: &Arc<Database>,
    registry: &ConnectionRegistry,
    message: &WsMessage,
) -> anyhow::Result<FanoutReport> {
    let Some(conversation_id) = message.frame.conversation_id() else {
        warn!(kind = message.frame.kind(), "Frame has no conversation, not fanning out");
        return Ok(FanoutReport::default());
    };

    let online = db
        .run(move |db| db.list_user_online_by_conversation(conversation_id))
        .await?;

    let ignored: HashSet<Uuid> = message.ignore_user_onlines.iter().copied().collect();
    let text = message.to_text()?;
    let mut report = FanoutReport::default();

    for entry in online.iter().filter(|e| !ignored.contains(&e.id)) {
        report.audience += 1;

        let Some(handle) = registry.get(entry.connection_id).await else {
            report.skipped_offline += 1;
            continue;
        };

        match handle.send_text(text.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    %conversation_id,
                    user_online_id = %entry.id,
                    "Failed to send frame to websocket: {}",
                    e
                );
            }
        }
    }

    debug!(
        %conversation_id,
        kind = message.frame.kind(),
        audience = report.audience,
        delivered = report.delivered,
        skipped_offline = report.skipped_offline,
        failed = report.failed,
        "Fan-out complete"
    );
    Ok(report)
}

/// Plain subscription on the fan-out subject: every process sees every frame
/// and delivers it to the sockets it holds.
pub async fn start_fanout(
    bus: &BusClient,
    db: Arc<Database>,
    registry: ConnectionRegistry,
) -> Result<Subscription, BusError> {
    bus.subscribe(Subject::NewMessage, CONSUMER_WS_MESSAGE_NEW, move |delivery: Delivery| {
        let db = db.clone();
        let registry = registry.clone();
        async move {
            let message: WsMessage = delivery.json()?;
            fan_out(&db, &registry, &message).await?;
            Ok(())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use parley_types::events::{MessagePayload, WsFrame};
    use parley_types::models::{ConversationType, Message};

    use super::*;
    use crate::registry::Outbound;

    #[tokio::test]
    async fn skips_ignored_and_offline_entries() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ConnectionRegistry::new();

        let ada = db.create_user("acc-ada", "Ada", "").unwrap();
        let bob = db.create_user("acc-bob", "Bob", "").unwrap();
        let dm = db
            .create_conversation(ConversationType::Dm, "", "", &[ada.id, bob.id])
            .unwrap();

        let (ada_phone, mut ada_phone_rx) = registry.register().await;
        let (ada_laptop, mut ada_laptop_rx) = registry.register().await;
        let (bob_socket, mut bob_rx) = registry.register().await;
        let ada_phone_online = db.create_user_online(ada.id, ada_phone.id()).unwrap();
        db.create_user_online(ada.id, ada_laptop.id()).unwrap();
        db.create_user_online(bob.id, bob_socket.id()).unwrap();
        // presence row of a socket held by another process
        db.create_user_online(bob.id, Uuid::new_v4()).unwrap();

        let now = chrono::Utc::now();
        let frame = WsMessage::new(WsFrame::Message(MessagePayload {
            message: Message {
                id: Uuid::now_v7(),
                conversation_id: dm.id,
                user_id: ada.id,
                kind: "text".into(),
                body: "hi".into(),
                reply_to: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            user: None,
        }))
        .ignoring([ada_phone_online.id]);

        let report = fan_out(&db, &registry, &frame).await.unwrap();
        assert_eq!(
            report,
            FanoutReport {
                audience: 3,
                delivered: 2,
                skipped_offline: 1,
                failed: 0
            }
        );

        assert!(ada_phone_rx.try_recv().is_err());
        for rx in [&mut ada_laptop_rx, &mut bob_rx] {
            match rx.try_recv().unwrap() {
                Outbound::Text(text) => assert_eq!(WsMessage::decode(&text).unwrap(), frame),
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn frames_without_conversation_are_dropped() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let report = fan_out(&db, &ConnectionRegistry::new(), &WsMessage::new(WsFrame::Ping))
            .await
            .unwrap();
        assert_eq!(report, FanoutReport::default());
    }
}
