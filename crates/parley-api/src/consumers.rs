use std::sync::Arc;

use tracing::info;

use parley_bus::{BusClient, BusError, Delivery, Subscription};
use parley_db::Database;
use parley_types::subjects::{
    CONSUMER_FCM_MESSAGE, CONSUMER_SEEN_MESSAGE, CONSUMER_UPDATE_LAST_MESSAGE,
    PushMessageRef, QUEUE_FCM_MESSAGE, QUEUE_SEEN_MESSAGE, QUEUE_UPDATE_LAST_MESSAGE,
    SeenMessageEvent, Subject, UpdateLastMessageId,
};

use crate::last_message::handle_update_last_message;
use crate::push::{PushGateway, handle_push_message};
use crate::seen::handle_seen_message;

/// The queue-group consumers of one process.
#[derive(Default)]
pub struct Consumers {
    subscriptions: Vec<Subscription>,
}

impl Consumers {
    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Stop every consumer, waiting for in-flight handlers.
    pub async fn unsubscribe_all(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe().await;
        }
    }
}

/// Join the last-message, seen and push queue groups.
///
/// Each event on these subjects is handled by one member across all
/// processes. A handler error naks the event for redelivery.
pub async fn start_consumers(
    bus: &BusClient,
    db: Arc<Database>,
    push: Arc<dyn PushGateway>,
) -> Result<Consumers, BusError> {
    let mut consumers = Consumers::default();

    let (handler_db, handler_bus) = (db.clone(), bus.clone());
    consumers.add(bus.queue_subscribe(
        Subject::UpdateLastMessageId,
        CONSUMER_UPDATE_LAST_MESSAGE,
        QUEUE_UPDATE_LAST_MESSAGE,
        move |delivery: Delivery| {
            let db = handler_db.clone();
            let bus = handler_bus.clone();
            async move {
                let update: UpdateLastMessageId = delivery.json()?;
                handle_update_last_message(&db, &bus, update).await?;
                Ok(())
            }
        },
    )
    .await?);

    let (handler_db, handler_bus) = (db.clone(), bus.clone());
    consumers.add(bus.queue_subscribe(
        Subject::SeenMessage,
        CONSUMER_SEEN_MESSAGE,
        QUEUE_SEEN_MESSAGE,
        move |delivery: Delivery| {
            let db = handler_db.clone();
            let bus = handler_bus.clone();
            async move {
                let event: SeenMessageEvent = delivery.json()?;
                handle_seen_message(&db, &bus, event).await?;
                Ok(())
            }
        },
    )
    .await?);

    consumers.add(bus.queue_subscribe(
        Subject::PushMessage,
        CONSUMER_FCM_MESSAGE,
        QUEUE_FCM_MESSAGE,
        move |delivery: Delivery| {
            let db = db.clone();
            let push = push.clone();
            async move {
                let reference: PushMessageRef = delivery.json()?;
                handle_push_message(&db, push.as_ref(), reference).await?;
                Ok(())
            }
        },
    )
    .await?);

    info!(node = bus.node_id(), count = consumers.len(), "Consumers started");
    Ok(consumers)
}
