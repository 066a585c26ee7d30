//! Websocket connection tracking.
//!
//! Every upgraded socket gets a [`ConnectionHandle`] with a bounded outbound
//! queue; the socket's write loop drains the queue. Handles are exposed on
//! the context so middleware can push frames to the peer outside the normal
//! reply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use koatty_core::KoattyProtocol;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

/// Registry-assigned connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Bytes),
    /// Close frame with an optional reason.
    Close(Option<String>),
}

/// Failure to queue a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue stayed full past the send timeout")]
    Timeout,
    #[error("connection closed")]
    Disconnected,
}

/// One open websocket.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub protocol: KoattyProtocol,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundMessage>,
    send_timeout: Duration,
}

impl ConnectionHandle {
    /// Queues a frame without waiting. `false` if the queue is full or closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Queues a frame, waiting up to the configured send timeout.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] if the queue stays full; [`SendError::Disconnected`]
    /// once the write loop has exited.
    pub async fn send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// See [`ConnectionHandle::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(OutboundMessage::Text(text.into())).await
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Concurrent map of open websockets.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Tracks a new socket and returns its handle plus the write-loop receiver.
    pub fn register(
        &self,
        protocol: KoattyProtocol,
        remote_addr: Option<SocketAddr>,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            protocol,
            remote_addr,
            connected_at: Instant::now(),
            tx,
            send_timeout: config.send_timeout,
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Queues `text` on every connection, skipping full queues.
    /// Returns how many connections accepted it.
    pub fn broadcast(&self, text: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().try_send(OutboundMessage::Text(text.to_string())))
            .count()
    }

    /// Removes every connection and returns their handles.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
