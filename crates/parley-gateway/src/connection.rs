use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{
    AuthorizationGranted, AuthorizationPayload, DecodeError, Envelope, WS_AUTHORIZATION, WS_PING,
    WsFrame, WsMessage,
};
use parley_types::models::UserOnline;

use crate::identity::{AuthError, Identity};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};

/// How long the writer gets to flush queued frames once the reader stops.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Time allowed for the AUTHORIZATION frame after upgrade.
    pub handshake_timeout: Duration,
    /// Server ping interval. Two missed pongs drop the connection.
    pub heartbeat_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Everything a socket needs to get admitted and served.
#[derive(Clone)]
pub struct Gateway {
    pub registry: ConnectionRegistry,
    pub db: Arc<Database>,
    pub identity: Identity,
    pub config: GatewayConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("authorization timed out")]
    Timeout,

    #[error("socket closed before authorization")]
    Closed,

    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),

    #[error("expected AUTHORIZATION, got {0}")]
    UnexpectedFrame(String),

    #[error("token not found in message")]
    MissingToken,

    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("no user for account {0}")]
    UnknownAccount(String),

    #[error("failed to resolve user: {0}")]
    Store(#[source] anyhow::Error),

    #[error("failed to create user online: {0}")]
    Presence(#[source] anyhow::Error),
}

impl HandshakeError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Decode(_) => close_code::UNSUPPORTED,
            Self::Store(_) | Self::Presence(_) => close_code::ERROR,
            _ => close_code::POLICY,
        }
    }
}

/// Identity of an admitted socket.
#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: String,
    pub user_id: Uuid,
    pub presence: UserOnline,
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

pub async fn ws_upgrade(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, gateway))
}

/// Run one websocket from upgrade to close.
///
/// The first frame must be AUTHORIZATION. Until it is accepted nothing is
/// registered and no presence row exists. After that the socket is served
/// until either side stops, and the registry entry and presence row are
/// always removed on the way out.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    let (session, handle, outbound_rx) = match admit(&gateway, &mut receiver).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!("WebSocket handshake failed: {}", e);
            if !matches!(e, HandshakeError::Closed) {
                reject(&mut sender, &e).await;
            }
            return;
        }
    };

    let granted = WsMessage::new(WsFrame::Authorization(AuthorizationPayload::Granted(
        AuthorizationGranted {
            account_id: session.account_id.clone(),
            user_id: session.user_id,
            user_online_id: session.presence.id,
        },
    )));
    // written before the writer task starts, so it precedes any fan-out frame
    let acked = match granted.to_text() {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode authorization ack: {}", e);
            false
        }
    };

    if acked {
        info!(
            user_id = %session.user_id,
            connection_id = %handle.id(),
            user_online_id = %session.presence.id,
            "User connected to gateway"
        );
        run_connection_loop(sender, receiver, &gateway, &handle, outbound_rx).await;
    }

    gateway.registry.remove(handle.id()).await;
    let presence_id = session.presence.id;
    match gateway.db.run(move |db| db.delete_user_online(presence_id)).await {
        Ok(_) => {}
        Err(e) => warn!(user_online_id = %presence_id, "Failed to delete user online: {:#}", e),
    }

    info!(
        user_id = %session.user_id,
        connection_id = %handle.id(),
        "User disconnected from gateway"
    );
}

/// Wait for AUTHORIZATION, resolve the account, then register the socket
/// and create its presence row.
async fn admit(
    gateway: &Gateway,
    receiver: &mut WsReceiver,
) -> Result<(Session, ConnectionHandle, mpsc::UnboundedReceiver<Outbound>), HandshakeError> {
    let token = tokio::time::timeout(gateway.config.handshake_timeout, wait_for_authorization(receiver))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    let claims = gateway.identity.validate(&token)?;
    let account_id = claims.sub;

    let lookup = account_id.clone();
    let user_id = gateway
        .db
        .run(move |db| db.get_user_id_by_account_id(&lookup))
        .await
        .map_err(HandshakeError::Store)?
        .ok_or_else(|| HandshakeError::UnknownAccount(account_id.clone()))?;

    let (handle, outbound_rx) = gateway.registry.register().await;
    let connection_id = handle.id();
    let presence = match gateway
        .db
        .run(move |db| db.create_user_online(user_id, connection_id))
        .await
    {
        Ok(presence) => presence,
        Err(e) => {
            gateway.registry.remove(connection_id).await;
            return Err(HandshakeError::Presence(e));
        }
    };

    Ok((
        Session {
            account_id,
            user_id,
            presence,
        },
        handle,
        outbound_rx,
    ))
}

async fn wait_for_authorization(receiver: &mut WsReceiver) -> Result<String, HandshakeError> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let envelope = Envelope::decode(&text)?;
                if envelope.kind != WS_AUTHORIZATION {
                    return Err(HandshakeError::UnexpectedFrame(envelope.kind));
                }
                return envelope
                    .token()
                    .map(str::to_string)
                    .ok_or(HandshakeError::MissingToken);
            }
            Message::Binary(_) => return Err(HandshakeError::UnexpectedFrame("binary".into())),
            Message::Close(_) => return Err(HandshakeError::Closed),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Err(HandshakeError::Closed)
}

/// Explain the failure in a text frame, then close.
async fn reject(sender: &mut WsSender, error: &HandshakeError) {
    let _ = sender.send(Message::Text(error.to_string().into())).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: error.close_code(),
            reason: "authorization failed".into(),
        })))
        .await;
}

async fn run_connection_loop(
    mut sender: WsSender,
    mut receiver: WsReceiver,
    gateway: &Gateway,
    handle: &ConnectionHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let connection_id = handle.id();
    let heartbeat_interval = gateway.config.heartbeat_interval;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Drain the outbound queue to the socket, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                next = outbound_rx.recv() => {
                    match next {
                        Some(Outbound::Text(text)) => {
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame { code, reason: reason.into() };
                            let _ = sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(%connection_id, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read frames from the client
    let reply = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                // only the envelope is checked: payloads of ignored frames may have any shape
                Message::Text(text) => match Envelope::decode(&text) {
                    Ok(envelope) if envelope.kind == WS_PING => {
                        if reply.send(&WsMessage::new(WsFrame::Pong)).is_err() {
                            break;
                        }
                    }
                    Ok(envelope) => trace!(%connection_id, kind = %envelope.kind, "Ignoring client frame"),
                    Err(e) => {
                        let raw = text.as_str();
                        warn!(%connection_id, "Bad frame: {} -- raw: {}", e, raw.get(..200).unwrap_or(raw));
                        let _ = reply.send_text(format!("Failed to decode message: {}", e));
                        reply.close(close_code::UNSUPPORTED, "malformed frame");
                        break;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            // let the writer flush what is queued, ending with a close frame
            gateway.registry.remove(connection_id).await;
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                debug!(%connection_id, "Writer did not finish in time");
                send_task.abort();
            }
        }
    }
}
