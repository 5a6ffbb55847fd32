//! End-to-end distribution across two server processes sharing one store
//! and one Redis. Tests that need the bus are skipped when no Redis answers
//! at `PARLEY_TEST_REDIS_URL`.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parley_api::{MessagePipeline, NewMessage, PipelineError, PublishOutcome};
use parley_bus::BusError;
use parley_gateway::FanoutReport;
use parley_gateway::fanout::fan_out;
use parley_types::events::{ConversationChanged, MessagePayload, WsFrame, WsMessage};
use parley_types::models::ConversationType;
use uuid::Uuid;

use common::*;

fn messages(frames: &[WsFrame]) -> Vec<&MessagePayload> {
    frames
        .iter()
        .filter_map(|f| match f {
            WsFrame::Message(payload) => Some(payload),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn message_reaches_other_member_exactly_once() {
    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let push = Arc::new(RecordingGateway::default());
    let node_a = start_node(fx.db.clone(), &config, "node-a", push.clone()).await;
    let node_b = start_node(fx.db.clone(), &config, "node-b", push).await;

    let mut ada_ws = connect(&node_a).await;
    let mut bob_ws = connect(&node_b).await;
    let ada_online = authorize(&mut ada_ws, "acc-ada").await;
    authorize(&mut bob_ws, "acc-bob").await;

    let sent = node_a
        .pipeline
        .send_message(NewMessage {
            sender_user_online_id: Some(ada_online.user_online_id),
            ..text_message(fx.dm, fx.ada, "hello")
        })
        .await
        .unwrap();
    assert!(sent.push.is_published());
    assert!(sent.fanout.is_published());
    assert!(sent.last_message.is_published());

    let bob_frames = drain_frames(&mut bob_ws, Duration::from_millis(300)).await;
    let received = messages(&bob_frames);
    assert_eq!(received.len(), 1, "frames: {:?}", bob_frames);
    assert_eq!(received[0].message, sent.message);
    assert_eq!(received[0].user.as_ref().unwrap().full_name, "Ada");

    // the sending socket is skipped for the message, not for the pointer move
    let ada_frames = drain_frames(&mut ada_ws, Duration::from_millis(100)).await;
    assert!(messages(&ada_frames).is_empty());
    assert!(
        ada_frames
            .iter()
            .any(|f| matches!(f, WsFrame::UpdateLastMessage(_)))
    );
}

#[tokio::test]
async fn sender_other_devices_get_the_message() {
    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let node = start_node(fx.db.clone(), &config, "node-a", Arc::new(RecordingGateway::default())).await;

    let mut phone = connect(&node).await;
    let mut laptop = connect(&node).await;
    let phone_online = authorize(&mut phone, "acc-ada").await;
    authorize(&mut laptop, "acc-ada").await;

    node.pipeline
        .send_message(NewMessage {
            sender_user_online_id: Some(phone_online.user_online_id),
            ..text_message(fx.dm, fx.ada, "from phone")
        })
        .await
        .unwrap();

    let laptop_frames = drain_frames(&mut laptop, Duration::from_millis(300)).await;
    assert_eq!(messages(&laptop_frames).len(), 1);
    let phone_frames = drain_frames(&mut phone, Duration::from_millis(100)).await;
    assert!(messages(&phone_frames).is_empty());
}

#[tokio::test]
async fn another_users_socket_cannot_be_skipped() {
    let Some(config) = bus_config().await else { return };
    let fx = fixture();
    let node = start_node(fx.db.clone(), &config, "node-a", Arc::new(RecordingGateway::default())).await;

    let mut bob_ws = connect(&node).await;
    let bob_online = authorize(&mut bob_ws, "acc-bob").await;

    // ada names bob's socket as her own
    let sent = node
        .pipeline
        .send_message(NewMessage {
            sender_user_online_id: Some(bob_online.user_online_id),
            ..text_message(fx.dm, fx.ada, "sneaky")
        })
        .await
        .unwrap();
    assert!(sent.fanout.is_published());

    let frames = drain_frames(&mut bob_ws, Duration::from_millis(300)).await;
    let received = messages(&frames);
    assert_eq!(received.len(), 1, "frames: {:?}", frames);
    assert_eq!(received[0].message.id, sent.message.id);
}

#[tokio::test]
async fn offline_conversation_fans_out_to_nobody() {
    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let node = start_node(fx.db.clone(), &config, "node-a", Arc::new(RecordingGateway::default())).await;

    let sent = node
        .pipeline
        .send_message(text_message(fx.dm, fx.ada, "anyone?"))
        .await
        .unwrap();

    let frame = WsMessage::new(WsFrame::Message(MessagePayload {
        message: sent.message.clone(),
        user: None,
    }));
    let report = fan_out(&fx.db, &node.registry, &frame).await.unwrap();
    assert_eq!(report, FanoutReport::default());

    let db = fx.db.clone();
    let dm = fx.dm;
    assert!(
        eventually(|| {
            let db = db.clone();
            async move { db.get_conversation(dm).unwrap().unwrap().revision == 1 }
        })
        .await
    );
    let stored = fx.db.list_messages(fx.dm, None, 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message.id, sent.message.id);
}

#[tokio::test]
async fn last_message_frames_report_their_own_revision() {
    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let node = start_node(fx.db.clone(), &config, "node-a", Arc::new(RecordingGateway::default())).await;
    let mut bob_ws = connect(&node).await;
    authorize(&mut bob_ws, "acc-bob").await;

    node.pipeline
        .send_message(text_message(fx.dm, fx.ada, "one"))
        .await
        .unwrap();
    node.pipeline
        .send_message(text_message(fx.dm, fx.bob, "two"))
        .await
        .unwrap();

    let mut changes: Vec<ConversationChanged> = Vec::new();
    while changes.len() < 2 {
        if let WsFrame::UpdateLastMessage(changed) = next_frame(&mut bob_ws).await.frame {
            changes.push(changed);
        }
    }

    let revisions: BTreeSet<i64> = changes.iter().map(|c| c.conversation.revision).collect();
    assert_eq!(revisions, BTreeSet::from([1, 2]));
    for changed in &changes {
        assert_eq!(
            changed.conversation.last_message_id,
            Some(changed.last_message.message.id)
        );
        assert_eq!(changed.members.len(), 2);
    }

    let latest = changes
        .iter()
        .find(|c| c.conversation.revision == 2)
        .unwrap();
    let stored = fx.db.get_conversation(fx.dm).unwrap().unwrap();
    assert_eq!(stored.last_message_id, latest.conversation.last_message_id);
    assert_eq!(stored.revision, 2);
}

#[tokio::test]
async fn concurrent_sends_settle_on_the_last_committed_update() {
    const SENDS: usize = 20;

    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let push = Arc::new(RecordingGateway::default());
    let node_a = start_node(fx.db.clone(), &config, "node-a", push.clone()).await;
    let node_b = start_node(fx.db.clone(), &config, "node-b", push).await;
    let mut bob_ws = connect(&node_b).await;
    authorize(&mut bob_ws, "acc-bob").await;

    let mut tasks = Vec::new();
    for i in 0..SENDS {
        let pipeline = if i % 2 == 0 {
            node_a.pipeline.clone()
        } else {
            node_b.pipeline.clone()
        };
        let (dm, ada) = (fx.dm, fx.ada);
        tasks.push(tokio::spawn(async move {
            pipeline
                .send_message(text_message(dm, ada, &format!("burst {}", i)))
                .await
                .unwrap()
                .message
                .id
        }));
    }
    let mut sent_ids = BTreeSet::new();
    for task in tasks {
        sent_ids.insert(task.await.unwrap());
    }

    let (mut received, mut changes) = (0, Vec::new());
    while received < SENDS || changes.len() < SENDS {
        match next_frame(&mut bob_ws).await.frame {
            WsFrame::Message(_) => received += 1,
            WsFrame::UpdateLastMessage(changed) => changes.push(changed),
            _ => {}
        }
    }

    let revisions: BTreeSet<i64> = changes.iter().map(|c| c.conversation.revision).collect();
    assert_eq!(revisions, (1..=SENDS as i64).collect::<BTreeSet<_>>());

    let stored = fx.db.get_conversation(fx.dm).unwrap().unwrap();
    assert_eq!(stored.revision, SENDS as i64);
    let last = changes
        .iter()
        .find(|c| c.conversation.revision == SENDS as i64)
        .unwrap();
    assert_eq!(stored.last_message_id, last.conversation.last_message_id);
    assert!(sent_ids.contains(&stored.last_message_id.unwrap()));

    let listed = node_a
        .pipeline
        .list_messages(fx.bob, fx.dm, None, 50)
        .await
        .unwrap();
    assert_eq!(listed.len(), SENDS);
}

#[tokio::test]
async fn drained_bus_keeps_the_message() {
    let fx = fixture();
    let pipeline = MessagePipeline::new(fx.db.clone(), closed_bus().await);

    let sent = pipeline
        .send_message(text_message(fx.dm, fx.ada, "still here"))
        .await
        .unwrap();
    assert_eq!(sent.push, PublishOutcome::Dropped);
    assert_eq!(sent.fanout, PublishOutcome::Dropped);
    assert_eq!(sent.last_message, PublishOutcome::Dropped);
    assert_eq!(fx.db.list_messages(fx.dm, None, 10).unwrap().len(), 1);

    let seen = pipeline.seen_message(fx.bob, fx.dm, sent.message.id).await;
    assert!(matches!(
        seen,
        Err(PipelineError::Distribution(BusError::Closed))
    ));
}

#[tokio::test]
async fn non_members_and_unknown_conversations_are_refused() {
    let fx = fixture();
    let carol = fx.db.create_user("acc-carol", "Carol", "").unwrap().id;
    let pipeline = MessagePipeline::new(fx.db.clone(), closed_bus().await);

    let err = pipeline
        .send_message(text_message(fx.dm, carol, "let me in"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotAMember { user_id, .. } if user_id == carol));

    let missing = Uuid::new_v4();
    let err = pipeline
        .send_message(text_message(missing, fx.ada, "void"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(id) if id == missing));

    let err = pipeline.list_seen(carol, fx.dm).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotAMember { .. }));
    assert!(fx.db.list_messages(fx.dm, None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn seen_watermark_is_stored_and_announced() {
    let fx = fixture();
    let Some(config) = bus_config().await else { return };
    let node = start_node(fx.db.clone(), &config, "node-a", Arc::new(RecordingGateway::default())).await;
    let mut ada_ws = connect(&node).await;
    authorize(&mut ada_ws, "acc-ada").await;

    let sent = node
        .pipeline
        .send_message(text_message(fx.dm, fx.ada, "read me"))
        .await
        .unwrap();
    node.pipeline
        .seen_message(fx.bob, fx.dm, sent.message.id)
        .await
        .unwrap();

    let seen = loop {
        if let WsFrame::SeenMessage(seen) = next_frame(&mut ada_ws).await.frame {
            break seen;
        }
    };
    assert_eq!(seen.user_id, fx.bob);
    assert_eq!(seen.message_id, sent.message.id);
    assert_eq!(seen.conversation_id, fx.dm);

    let watermarks = node.pipeline.list_seen(fx.ada, fx.dm).await.unwrap();
    assert_eq!(watermarks.len(), 1);
    assert_eq!(watermarks[0].user_id, fx.bob);
    assert_eq!(watermarks[0].message_id, sent.message.id);
}

#[tokio::test]
async fn group_members_on_both_nodes_receive_the_message() {
    let fx = fixture();
    let carol = fx.db.create_user("acc-carol", "Carol", "").unwrap().id;
    let group = fx
        .db
        .create_conversation(ConversationType::Group, "Crew", "", &[fx.ada, fx.bob, carol])
        .unwrap()
        .id;

    let Some(config) = bus_config().await else { return };
    let push = Arc::new(RecordingGateway::default());
    let node_a = start_node(fx.db.clone(), &config, "node-a", push.clone()).await;
    let node_b = start_node(fx.db.clone(), &config, "node-b", push).await;
    let mut bob_ws = connect(&node_a).await;
    let mut carol_ws = connect(&node_b).await;
    authorize(&mut bob_ws, "acc-bob").await;
    authorize(&mut carol_ws, "acc-carol").await;

    let sent = node_b
        .pipeline
        .send_message(text_message(group, fx.ada, "all hands"))
        .await
        .unwrap();

    for ws in [&mut bob_ws, &mut carol_ws] {
        let frames = drain_frames(ws, Duration::from_millis(300)).await;
        let received = messages(&frames);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.id, sent.message.id);
    }
}
