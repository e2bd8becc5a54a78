//! Injection seams for the client-side selector.
//!
//! The selector owns the transport-selection policy; how bytes actually move
//! is behind [`ClientTransport`], so embedding applications wire in their
//! WebSocket/EventSource/HTTP stacks and tests substitute fakes.

use crate::error::TransportError;
use crate::types::{BalanceSnapshot, ClientMessage, PollData, ServerMessage};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One established live-push connection, as the selector sees it.
///
/// `incoming` closing means the transport dropped; the selector treats that
/// as an unexpected close and applies its reconnect policy. Messages sent on
/// `outgoing` (pings) may be silently discarded by transports that have no
/// upstream direction, such as SSE.
pub struct TransportLink {
    pub incoming: mpsc::Receiver<ServerMessage>,
    pub outgoing: mpsc::Sender<ClientMessage>,
}

/// Connects the real transports. Implementations should apply their own
/// handshake semantics; the selector supplies the connect timeout.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    async fn connect_websocket(&self, token: &str) -> Result<TransportLink, TransportError>;

    async fn connect_sse(&self, token: &str) -> Result<TransportLink, TransportError>;

    /// One polling round-trip. Called without a token too, since polling is
    /// the terminal fallback; servers reject what they must.
    async fn poll(&self, token: Option<&str>) -> Result<PollData, TransportError>;
}

/// Where the selector finds the current auth token. A token change is
/// signalled separately via [`SelectorCommand::TokenChanged`]
/// (mirroring a storage-change notification).
///
/// [`SelectorCommand::TokenChanged`]: crate::client::SelectorCommand::TokenChanged
pub trait TokenStore: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

/// Persisted client-side snapshot cache, updated whenever a materially
/// different snapshot arrives.
pub trait SnapshotCache: Send + Sync + 'static {
    fn load(&self) -> Option<BalanceSnapshot>;
    fn store(&self, snapshot: &BalanceSnapshot);
}

/// In-memory token store for demos and tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }
}

/// In-memory snapshot cache for demos and tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    snapshot: Mutex<Option<BalanceSnapshot>>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotCache for MemorySnapshotCache {
    fn load(&self) -> Option<BalanceSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    fn store(&self, snapshot: &BalanceSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
    }
}
