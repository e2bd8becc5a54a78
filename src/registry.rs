//! Process-wide table of live push connections, keyed by user.

use crate::types::{ServerMessage, TransportKind, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A unique identifier for a single live connection, across transports.
pub type ConnectionId = Uuid;

/// Buffered outbound messages per connection. Dispatch sends are
/// fire-and-forget; a connection that falls this far behind starts dropping
/// updates, which is safe because every update carries a full snapshot.
pub const OUTBOUND_BUFFER: usize = 32;

/// One live transport handle for a user.
///
/// The transport server that accepted the connection owns the socket/stream;
/// the registry and dispatcher only hold this handle and write to its
/// outbound channel. When the owning server drops the receiving half,
/// `is_open` turns false and subsequent pushes are skipped.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    transport: TransportKind,
    tx: mpsc::Sender<ServerMessage>,
    opened_at: Instant,
    last_activity_ms: AtomicU64,
}

impl Connection {
    /// Creates a connection handle plus the receiving half the transport
    /// server drains into its socket or event stream.
    pub fn new(
        user_id: impl Into<UserId>,
        transport: TransportKind,
    ) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            transport,
            tx,
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Whether the owning transport still holds the receiving half.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Non-blocking send. Returns `false` if the connection is closed or its
    /// buffer is full; callers treat that as a skip, never an error.
    pub fn push(&self, msg: ServerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Records peer activity (e.g. an inbound ping).
    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Milliseconds between the connection opening and the last recorded
    /// peer activity. Zero if the peer has never spoken.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("transport", &self.transport)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Maps each user to the set of currently open push connections for that
/// user, across transports.
///
/// Explicitly owned and injected: constructed once per server process and
/// passed to the transport servers and dispatcher by reference. Safe under
/// concurrent register/unregister from connection handlers racing with
/// dispatcher reads.
///
/// Invariant: a user with zero open connections has no entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection under its user, creating the user's set if absent.
    pub fn register(&self, conn: Arc<Connection>) {
        debug!(
            conn_id = %conn.id(),
            user_id = %conn.user_id(),
            transport = %conn.transport(),
            "registering connection"
        );
        self.by_user
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.id);
        self.connections.insert(conn.id, conn);
    }

    /// Removes a connection. Idempotent: unregistering a connection that is
    /// not present is a no-op. The user's entry is removed eagerly once its
    /// set empties.
    pub fn unregister(&self, user_id: &str, conn_id: ConnectionId) {
        if self.connections.remove(&conn_id).is_some() {
            debug!(conn_id = %conn_id, user_id = %user_id, "unregistering connection");
        }
        if let Some(mut ids) = self.by_user.get_mut(user_id) {
            ids.remove(&conn_id);
        }
        self.by_user.remove_if(user_id, |_, ids| ids.is_empty());
    }

    /// Snapshot-safe read: a copied `Vec` so dispatch can iterate while
    /// connects and disconnects keep mutating the map. Empty if the user has
    /// no entry.
    pub fn connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let Some(ids) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|e| Arc::clone(e.value())))
            .collect()
    }

    /// Total open connections across all users, for observability.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Whether the user currently appears in the registry at all.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("users", &self.by_user.len())
            .finish()
    }
}
