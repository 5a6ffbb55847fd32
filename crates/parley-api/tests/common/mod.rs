#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use parley_api::{
    AppState, AppStateInner, Consumers, MessagePipeline, NewMessage, PushError, PushGateway,
    PushNotification, start_consumers,
};
use parley_bus::{Broker, BrokerConfig, BusClient, Subscription};
use parley_db::Database;
use parley_gateway::fanout::start_fanout;
use parley_gateway::{ConnectionRegistry, Gateway, GatewayConfig, Identity, ws_upgrade};
use parley_types::events::{AuthorizationGranted, AuthorizationPayload, WsFrame, WsMessage};
use parley_types::models::ConversationType;

pub const SECRET: &str = "api-test-secret";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push gateway that keeps what it was asked to send.
#[derive(Default)]
pub struct RecordingGateway {
    pub sent: Mutex<Vec<PushNotification>>,
    /// Tokens the gateway refuses.
    pub reject: Vec<String>,
}

impl RecordingGateway {
    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingGateway {
    async fn send(&self, notification: &PushNotification) -> Result<(), PushError> {
        if self.reject.contains(&notification.token) {
            return Err(PushError::Rejected {
                status: 404,
                body: "UNREGISTERED".into(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Bus settings on a fresh namespace of the test Redis
/// (`PARLEY_TEST_REDIS_URL`), or `None` when no server answers. Tests that
/// need the bus return early in that case.
pub async fn bus_config() -> Option<BrokerConfig> {
    let url = std::env::var("PARLEY_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let config = BrokerConfig {
        url,
        namespace: format!("parley-test-{}", Uuid::new_v4()),
        nak_delay: Duration::from_millis(5),
        max_nak_delay: Duration::from_millis(20),
        ack_wait: Duration::from_millis(500),
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let broker = Broker::open(config.clone()).ok()?;
    match timeout(Duration::from_secs(1), broker.ping()).await {
        Ok(Ok(())) => Some(config),
        _ => {
            eprintln!("skipping: no Redis at {}", config.url);
            None
        }
    }
}

/// A bus client for one node, on its own connections like a separate process.
pub fn open_bus(config: &BrokerConfig, node_id: &str) -> BusClient {
    Broker::open(config.clone()).unwrap().client(node_id)
}

/// A bus that refuses every publish, for tests that only look at the store.
pub async fn closed_bus() -> BusClient {
    let broker = Broker::open(BrokerConfig::default()).unwrap();
    broker.drain().await;
    broker.client("closed")
}

/// One server process: gateway, pipeline and consumers on a shared store,
/// with its own connections to the bus.
pub struct Node {
    pub addr: SocketAddr,
    pub bus: BusClient,
    pub registry: ConnectionRegistry,
    pub pipeline: MessagePipeline,
    pub state: AppState,
    pub fanout: Subscription,
    pub consumers: Consumers,
}

pub async fn start_node(
    db: Arc<Database>,
    config: &BrokerConfig,
    node_id: &str,
    push: Arc<dyn PushGateway>,
) -> Node {
    let bus = open_bus(config, node_id);
    let registry = ConnectionRegistry::new();
    let gateway = Gateway {
        registry: registry.clone(),
        db: db.clone(),
        identity: Identity::new(SECRET),
        config: GatewayConfig::default(),
    };
    let pipeline = MessagePipeline::new(db.clone(), bus.clone());
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        identity: Identity::new(SECRET),
        pipeline: pipeline.clone(),
    });

    let fanout = start_fanout(&bus, db.clone(), registry.clone()).await.unwrap();
    let consumers = start_consumers(&bus, db, push).await.unwrap();

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway)
        .merge(parley_api::router(state.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Node {
        addr,
        bus,
        registry,
        pipeline,
        state,
        fanout,
        consumers,
    }
}

/// Two users sharing a DM.
pub struct Fixture {
    pub db: Arc<Database>,
    pub ada: Uuid,
    pub bob: Uuid,
    pub dm: Uuid,
}

pub fn fixture() -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let ada = db.create_user("acc-ada", "Ada", "").unwrap().id;
    let bob = db.create_user("acc-bob", "Bob", "").unwrap().id;
    let dm = db
        .create_conversation(ConversationType::Dm, "", "", &[ada, bob])
        .unwrap()
        .id;
    Fixture { db, ada, bob, dm }
}

pub fn text_message(conversation_id: Uuid, sender_id: Uuid, body: &str) -> NewMessage {
    NewMessage {
        conversation_id,
        sender_id,
        kind: "text".into(),
        body: body.into(),
        reply_to: None,
        sender_user_online_id: None,
    }
}

pub async fn connect(node: &Node) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", node.addr))
        .await
        .unwrap();
    ws
}

pub fn token_for(account_id: &str) -> String {
    Identity::new(SECRET)
        .issue(account_id, chrono::Duration::minutes(5))
        .unwrap()
}

/// Authorize and return the server's acknowledgement.
pub async fn authorize(ws: &mut Client, account_id: &str) -> AuthorizationGranted {
    let request = WsMessage::new(WsFrame::Authorization(AuthorizationPayload::Request {
        token: token_for(account_id),
    }));
    ws.send(Message::text(request.to_text().unwrap())).await.unwrap();

    match next_frame(ws).await.frame {
        WsFrame::Authorization(AuthorizationPayload::Granted(granted)) => granted,
        other => panic!("expected authorization ack, got {:?}", other),
    }
}

/// Next decoded frame, skipping control frames.
pub async fn next_frame(ws: &mut Client) -> WsMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return WsMessage::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

/// Every frame that arrives until the socket has been quiet for `quiet`.
pub async fn drain_frames(ws: &mut Client, quiet: Duration) -> Vec<WsFrame> {
    let mut frames = Vec::new();
    while let Ok(Some(Ok(msg))) = timeout(quiet, ws.next()).await {
        if let Message::Text(text) = msg {
            frames.push(WsMessage::decode(text.as_str()).unwrap().frame);
        }
    }
    frames
}

/// Poll `check` until it holds or two seconds have passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
