use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::close_code;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::WsMessage;

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(Uuid),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half of one open socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.tx
            .send(Outbound::Text(text.into()))
            .map_err(|_| SendError::Closed(self.id))
    }

    pub fn send(&self, message: &WsMessage) -> Result<(), SendError> {
        self.send_text(message.to_text()?)
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Open sockets of this process, keyed by connection id.
///
/// Connection ids are what presence rows point at; a presence row whose
/// connection id is not in this registry belongs to another process or to
/// a socket that is already gone.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new socket. Returns its handle and the receiver the
    /// socket's writer drains.
    pub async fn register(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            tx,
        };
        self.inner
            .connections
            .write()
            .await
            .insert(handle.id, handle.clone());
        debug!(connection_id = %handle.id, "Connection registered");
        (handle, rx)
    }

    /// A miss means the target is offline on this process.
    pub async fn get(&self, id: Uuid) -> Option<ConnectionHandle> {
        self.inner.connections.read().await.get(&id).cloned()
    }

    /// Close the socket and forget it. Returns false if it was not registered.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.inner.connections.write().await.remove(&id);
        match removed {
            Some(handle) => {
                handle.close(close_code::NORMAL, "");
                debug!(connection_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every open connection.
    pub async fn list(&self) -> Vec<ConnectionHandle> {
        self.inner.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use parley_types::events::WsFrame;

    use super::*;

    #[tokio::test]
    async fn remove_closes_and_forgets() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.register().await;
        let id = handle.id();

        assert!(registry.get(id).await.is_some());
        assert!(registry.remove(id).await);
        assert!(registry.get(id).await.is_none());
        assert!(!registry.remove(id).await);

        assert!(matches!(rx.recv().await, Some(Outbound::Close { code: 1000, .. })));
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register().await;
        let (b, _rx_b) = registry.register().await;

        let snapshot = registry.list().await;
        registry.remove(a.id()).await;

        let mut ids: Vec<Uuid> = snapshot.iter().map(|h| h.id()).collect();
        ids.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register().await;

        handle.send(&WsMessage::new(WsFrame::Pong)).unwrap();
        drop(rx);

        let err = handle.send(&WsMessage::new(WsFrame::Pong)).unwrap_err();
        assert!(matches!(err, SendError::Closed(id) if id == handle.id()));
        assert!(handle.is_closed());
    }
}
