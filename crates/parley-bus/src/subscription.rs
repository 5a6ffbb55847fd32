use std::future::Future;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerConfig, Delivery, PAYLOAD_FIELD};
use crate::error::BusError;

const BATCH_SIZE: usize = 16;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A running consumer member. Dropping it leaves the member running until
/// the broker drains; call [`Subscription::unsubscribe`] to stop it.
pub struct Subscription {
    group: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Stop pulling events. A handler already running is allowed to finish
    /// and its event is acked or nak'ed as usual; everything else stays on
    /// the consumer group.
    pub async fn unsubscribe(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(group = %self.group, "Consumer member ended abnormally: {}", e);
        }
        debug!(group = %self.group, "Unsubscribed");
    }
}

/// Marks a plain consumer as taken in this process until dropped.
pub(crate) struct ExclusiveSlot {
    broker: Broker,
    slot: String,
}

impl ExclusiveSlot {
    pub(crate) fn new(broker: Broker, slot: String) -> Self {
        Self { broker, slot }
    }
}

impl Drop for ExclusiveSlot {
    fn drop(&mut self) {
        self.broker.release_exclusive(&self.slot);
    }
}

pub(crate) struct Member {
    pub(crate) subject: String,
    pub(crate) key: String,
    pub(crate) group: String,
    pub(crate) consumer: String,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Member {
    /// Entries due for redelivery first, then new ones. Each entry comes
    /// with the attempt number it is delivered as.
    async fn next_batch(
        &self,
        conn: &mut MultiplexedConnection,
        config: &BrokerConfig,
    ) -> Result<Vec<(StreamId, u32)>, BusError> {
        let reclaimed = self.reclaim(conn, config).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(BATCH_SIZE)
            .arg("BLOCK")
            .arg(millis(config.poll_interval).max(1))
            .arg("STREAMS")
            .arg(&self.key)
            .arg(">")
            .query_async(conn)
            .await?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|entry| (entry, 1))
            .collect())
    }

    /// Claim pending entries that have sat idle for `ack_wait`: nak'ed ones
    /// (backdated by `nak`) and ones held by members that died.
    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        config: &BrokerConfig,
    ) -> Result<Vec<(StreamId, u32)>, BusError> {
        let min_idle = millis(config.ack_wait);
        let pending: Vec<(String, String, u64, u32)> = redis::cmd("XPENDING")
            .arg(&self.key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(BATCH_SIZE)
            .query_async(conn)
            .await?;

        let mut batch = Vec::new();
        for (id, owner, _idle, delivered) in pending {
            if config.is_exhausted(delivered) {
                error!(
                    subject = %self.subject,
                    group = %self.group,
                    id = %id,
                    owner = %owner,
                    delivered,
                    "Dropping unacked event after final delivery attempt"
                );
                self.ack(conn, &id).await?;
                continue;
            }

            // min-idle makes the claim fail if another member got there first
            let claimed: StreamClaimReply = conn
                .xclaim(&self.key, &self.group, &self.consumer, min_idle, &[&id])
                .await?;
            batch.extend(claimed.ids.into_iter().map(|entry| (entry, delivered + 1)));
        }
        Ok(batch)
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<(), BusError> {
        let _: i64 = conn.xack(&self.key, &self.group, &[id]).await?;
        Ok(())
    }

    /// Keep the entry pending but set its idle time so that it reaches
    /// `ack_wait` once the backoff for `attempt` has passed.
    async fn nak(
        &self,
        conn: &mut MultiplexedConnection,
        config: &BrokerConfig,
        id: &str,
        attempt: u32,
    ) -> Result<(), BusError> {
        let idle = config.ack_wait.saturating_sub(config.redelivery_delay(attempt));
        let _: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(id)
            .arg("IDLE")
            .arg(millis(idle))
            .arg("JUSTID")
            .query_async(conn)
            .await?;
        Ok(())
    }

    async fn process<H, Fut>(
        &self,
        conn: &mut MultiplexedConnection,
        config: &BrokerConfig,
        handler: &H,
        entry: StreamId,
        attempt: u32,
    ) -> Result<(), BusError>
    where
        H: Fn(Delivery) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
        let delivery = Delivery {
            subject: self.subject.clone(),
            id: entry.id.clone(),
            payload: payload.into(),
            attempt,
        };

        match handler(delivery).await {
            Ok(()) => self.ack(conn, &entry.id).await,
            Err(e) if config.is_exhausted(attempt) => {
                error!(
                    subject = %self.subject,
                    group = %self.group,
                    id = %entry.id,
                    attempt,
                    "Dropping event after final delivery attempt: {:#}",
                    e
                );
                self.ack(conn, &entry.id).await
            }
            Err(e) => {
                warn!(
                    subject = %self.subject,
                    group = %self.group,
                    id = %entry.id,
                    attempt,
                    "Handler failed, event will be redelivered: {:#}",
                    e
                );
                self.nak(conn, config, &entry.id, attempt).await
            }
        }
    }
}

pub(crate) fn spawn_member<H, Fut>(
    broker: Broker,
    member: Member,
    mut conn: MultiplexedConnection,
    slot: Option<ExclusiveSlot>,
    handler: H,
) -> Subscription
where
    H: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let token = broker.inner.shutdown.child_token();
    let member_token = token.clone();
    let group = member.group.clone();
    let tracker = broker.inner.tracker.clone();

    let handle = tracker.spawn(async move {
        let _slot = slot;
        let config = &broker.inner.config;
        debug!(
            subject = %member.subject,
            group = %member.group,
            consumer = %member.consumer,
            "Consumer member started"
        );

        'member: loop {
            let batch = tokio::select! {
                biased;
                _ = member_token.cancelled() => break,
                batch = member.next_batch(&mut conn, config) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(
                        subject = %member.subject,
                        group = %member.group,
                        "Consumer read failed: {}",
                        e
                    );
                    tokio::select! {
                        _ = member_token.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };

            for (entry, attempt) in batch {
                // left pending, reclaimed by the next member
                if member_token.is_cancelled() {
                    break 'member;
                }
                if let Err(e) = member.process(&mut conn, config, &handler, entry, attempt).await {
                    warn!(
                        subject = %member.subject,
                        group = %member.group,
                        "Failed to settle event: {}",
                        e
                    );
                }
            }
        }

        debug!(group = %member.group, consumer = %member.consumer, "Consumer member stopped");
    });

    Subscription {
        group,
        token,
        handle,
    }
}
