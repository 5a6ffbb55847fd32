#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley_bus::{Broker, BrokerConfig};
use parley_db::Database;
use parley_gateway::{ConnectionRegistry, Gateway, GatewayConfig, Identity, ws_upgrade};
use parley_types::events::{AuthorizationGranted, AuthorizationPayload, WsFrame, WsMessage};

pub const SECRET: &str = "gateway-test-secret";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One gateway process serving `/ws` on an ephemeral port.
pub struct Node {
    pub addr: SocketAddr,
    pub gateway: Gateway,
}

pub async fn start_node(db: Arc<Database>) -> Node {
    let gateway = Gateway {
        registry: ConnectionRegistry::new(),
        db,
        identity: Identity::new(SECRET),
        config: GatewayConfig {
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    };
    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Node { addr, gateway }
}

/// Bus settings on a fresh namespace of the test Redis
/// (`PARLEY_TEST_REDIS_URL`), or `None` when no server answers.
pub async fn bus_config() -> Option<BrokerConfig> {
    let url = std::env::var("PARLEY_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let config = BrokerConfig {
        url,
        namespace: format!("parley-test-{}", uuid::Uuid::new_v4()),
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

pub async fn send_frame(ws: &mut Client, message: &WsMessage) {
    ws.send(Message::text(message.to_text().unwrap())).await.unwrap();
}

/// Next text frame, skipping control frames.
pub async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text.as_str().to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

/// Read until the server closes; returns the close code.
pub async fn close_code(ws: &mut Client) -> Option<u16> {
    loop {
        let next = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Authorize and return the server's acknowledgement.
pub async fn authorize(ws: &mut Client, account_id: &str) -> AuthorizationGranted {
    let request = WsMessage::new(WsFrame::Authorization(AuthorizationPayload::Request {
        token: token_for(account_id),
    }));
    send_frame(ws, &request).await;

    match WsMessage::decode(&next_text(ws).await).unwrap().frame {
        WsFrame::Authorization(AuthorizationPayload::Granted(granted)) => granted,
        other => panic!("expected authorization ack, got {:?}", other),
    }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
