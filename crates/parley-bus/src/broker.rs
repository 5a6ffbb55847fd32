use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamMaxlen;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::BusError;
use crate::subscription::{self, ExclusiveSlot, Member, Subscription};

/// Stream entry field holding the event body.
pub(crate) const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    /// Key prefix. Nodes only share events within one namespace.
    pub namespace: String,
    /// Approximate number of entries kept per subject.
    pub max_retained: usize,
    /// Delivery attempts before a failing event is dropped. `None` retries forever.
    pub max_deliver: Option<u32>,
    /// Redelivery delay after the first nak, multiplied by the attempt number.
    pub nak_delay: Duration,
    pub max_nak_delay: Duration,
    /// Idle time after which an unacked entry is taken from the member
    /// holding it. Must exceed the slowest handler.
    pub ack_wait: Duration,
    /// Longest a member blocks on `XREADGROUP` before checking for entries
    /// to reclaim.
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            namespace: "parley".into(),
            max_retained: 10_000,
            max_deliver: Some(10),
            nak_delay: Duration::from_millis(500),
            max_nak_delay: Duration::from_secs(30),
            ack_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl BrokerConfig {
    /// Backoff before delivery number `delivered + 1`.
    pub fn redelivery_delay(&self, delivered: u32) -> Duration {
        self.nak_delay
            .saturating_mul(delivered.max(1))
            .min(self.max_nak_delay)
    }

    pub fn is_exhausted(&self, delivered: u32) -> bool {
        self.max_deliver.is_some_and(|max| delivered >= max)
    }
}

/// One event handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    /// Redis stream entry id (`<ms>-<seq>`).
    pub id: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_slice(&self.payload).map_err(|source| BusError::Decode {
            subject: self.subject.clone(),
            source,
        })
    }
}

/// Connection to the Redis server carrying the streams. Each process opens
/// its own; nodes meet on the server.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    client: redis::Client,
    publisher: OnceCell<ConnectionManager>,
    closed: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    /// Plain consumers with a live member in this process.
    exclusive: Mutex<HashSet<String>>,
    member_seq: AtomicU64,
}

impl Broker {
    /// Parse the URL. The first publish or subscribe connects.
    pub fn open(config: BrokerConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                config,
                client,
                publisher: OnceCell::new(),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                exclusive: Mutex::new(HashSet::new()),
                member_seq: AtomicU64::new(0),
            }),
        })
    }

    pub async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// A client for one node of the fleet. Plain subscriptions made through
    /// it are scoped to `node_id`.
    pub fn client(&self, node_id: impl Into<String>) -> BusClient {
        BusClient {
            broker: self.clone(),
            node_id: node_id.into().into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Reject further publishes, stop every member and wait for in-flight
    /// handlers to return. Unacked entries stay pending on the server.
    pub async fn drain(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("Draining event bus");
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Event bus drained");
    }

    pub(crate) fn stream_key(&self, subject: &str) -> String {
        format!("{}:{}", self.inner.config.namespace, subject)
    }

    fn bindings_key(&self) -> String {
        format!("{}:consumers", self.inner.config.namespace)
    }

    async fn publisher(&self) -> Result<ConnectionManager, BusError> {
        let conn = self
            .inner
            .publisher
            .get_or_try_init(|| ConnectionManager::new(self.inner.client.clone()))
            .await?;
        Ok(conn.clone())
    }

    fn exclusive(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.exclusive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_exclusive(&self, slot: &str) {
        self.exclusive().remove(slot);
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<String, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let key = self.stream_key(subject);
        let mut conn = self.publisher().await?;
        let id: String = conn
            .xadd_maxlen(
                &key,
                StreamMaxlen::Approx(self.inner.config.max_retained),
                "*",
                &[(PAYLOAD_FIELD, &payload[..])],
            )
            .await?;
        Ok(id)
    }

    /// Record which queue group a consumer belongs to (`""` for plain) the
    /// first time it is used, and refuse a different one afterwards.
    async fn bind(&self, subject: &str, durable: &str, group: Option<&str>) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        let field = format!("{}/{}", subject, durable);
        let requested = group.unwrap_or_default();

        let _: bool = conn.hset_nx(self.bindings_key(), &field, requested).await?;
        let existing: Option<String> = conn.hget(self.bindings_key(), &field).await?;
        let existing = existing.unwrap_or_default();

        if existing != requested {
            return Err(BusError::GroupMismatch {
                durable: durable.to_string(),
                existing: Some(existing).filter(|g| !g.is_empty()),
                requested: group.map(str::to_string),
            });
        }
        Ok(())
    }

    /// Create the consumer group if it does not exist yet and open the
    /// member's own connection. Blocking reads stall a connection, so
    /// members never share one.
    async fn join(&self, key: &str, group: &str, start: &str) -> Result<MultiplexedConnection, BusError> {
        let mut conn = self.inner.client.get_multiplexed_async_connection().await?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => debug!(stream = key, group, start, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(conn)
    }
}

/// Per-node handle on the broker.
#[derive(Clone)]
pub struct BusClient {
    broker: Broker,
    node_id: Arc<str>,
}

impl BusClient {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append to the subject's stream. Returns the entry id.
    pub async fn publish(&self, subject: impl AsRef<str>, payload: impl Into<Bytes>) -> Result<String, BusError> {
        self.broker.publish(subject.as_ref(), payload.into()).await
    }

    pub async fn publish_json<T: Serialize>(&self, subject: impl AsRef<str>, value: &T) -> Result<String, BusError> {
        let payload = serde_json::to_vec(value).map_err(BusError::Encode)?;
        self.publish(subject, payload).await
    }

    /// Plain subscription: this node gets its own group named
    /// `<durable>-<node_id>`, with at most one active member per process.
    pub async fn subscribe<H, Fut>(
        &self,
        subject: impl AsRef<str>,
        durable: &str,
        handler: H,
    ) -> Result<Subscription, BusError>
    where
        H: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.broker.is_closed() {
            return Err(BusError::Closed);
        }

        let subject = subject.as_ref();
        let group = format!("{}-{}", durable, self.node_id);
        let key = self.broker.stream_key(subject);

        let slot = format!("{}/{}", key, group);
        if !self.broker.exclusive().insert(slot.clone()) {
            return Err(BusError::ConsumerBusy(group));
        }
        let slot = ExclusiveSlot::new(self.broker.clone(), slot);

        self.broker.bind(subject, &group, None).await?;
        let conn = self.broker.join(&key, &group, "$").await?;

        let member = Member {
            subject: subject.to_string(),
            key,
            consumer: self.node_id.to_string(),
            group,
        };
        Ok(subscription::spawn_member(self.broker.clone(), member, conn, Some(slot), handler))
    }

    /// Queue-group subscription: members sharing `durable` split the events
    /// between them. `group` is fixed for a durable on first use.
    pub async fn queue_subscribe<H, Fut>(
        &self,
        subject: impl AsRef<str>,
        durable: &str,
        group: &str,
        handler: H,
    ) -> Result<Subscription, BusError>
    where
        H: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.broker.is_closed() {
            return Err(BusError::Closed);
        }

        let subject = subject.as_ref();
        let key = self.broker.stream_key(subject);

        self.broker.bind(subject, durable, Some(group)).await?;
        let conn = self.broker.join(&key, durable, "0").await?;

        let n = self.broker.inner.member_seq.fetch_add(1, Ordering::Relaxed);
        let member = Member {
            subject: subject.to_string(),
            key,
            consumer: format!("{}-{}", self.node_id, n),
            group: durable.to_string(),
        };
        Ok(subscription::spawn_member(self.broker.clone(), member, conn, None, handler))
    }
}
