//! Wire messages and core data types shared by the server and client halves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for an authenticated principal. All registry and bus
/// keys are scoped by it.
pub type UserId = String;

/// Current Unix time in milliseconds, the unit used for all wire timestamps.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// One itemized balance line: credits from a single source, with an optional
/// expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub credit_type: String,
    pub amount: i64,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// The full credit state for a user as of the moment it was fetched.
///
/// Snapshots are produced fresh on demand and never cached beyond a single
/// push cycle. A snapshot is authoritative: clients apply the latest one
/// received and may ignore delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub total_credits: i64,
    pub balances: Vec<BalanceEntry>,
}

/// The cause of a balance mutation. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Subscription,
    Purchase,
    Adjustment,
    Consumption,
}

/// A notification that some user's balance may have changed.
///
/// The `amount` delta is informational. The dispatcher always re-fetches the
/// authoritative snapshot because concurrent mutations can race and the delta
/// alone cannot express the resulting total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(user_id: impl Into<UserId>, amount: i64, kind: ChangeKind) -> Self {
        Self {
            user_id: user_id.into(),
            amount,
            kind,
            timestamp: now_millis(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Messages pushed from the server to a client. The same JSON schema is used
/// over WebSocket frames and SSE `data:` lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once per successful connection, acknowledging the resolved user.
    Connected {
        message: String,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// A fresh authoritative snapshot.
    BalanceUpdate { timestamp: u64, data: BalanceSnapshot },
    /// Sent before the connection is closed on an authentication failure.
    Error { message: String },
    /// Reply to a client `ping`, carrying the server timestamp.
    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn connected(user_id: impl Into<UserId>) -> Self {
        Self::Connected {
            message: "Credit updates connected".to_string(),
            user_id: user_id.into(),
        }
    }

    pub fn balance_update(data: BalanceSnapshot) -> Self {
        Self::BalanceUpdate {
            timestamp: now_millis(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Messages a client may send upstream. This is a push-only channel, so the
/// only recognized message is the keepalive ping (WebSocket only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping { timestamp: u64 },
}

/// The delivery mechanism carrying balance updates to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Sse,
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Polling => write!(f, "polling"),
        }
    }
}

/// Body of the polling endpoint response, also consumed by the client's
/// polling transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub success: bool,
    pub data: PollData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollData {
    pub total_credits: i64,
    pub balances: Vec<BalanceEntry>,
    pub timestamp: u64,
    /// Server hint, in seconds, for how often the client should poll.
    pub poll_interval: u64,
}

impl PollData {
    pub fn from_snapshot(snapshot: BalanceSnapshot, poll_interval: u64) -> Self {
        Self {
            total_credits: snapshot.total_credits,
            balances: snapshot.balances,
            timestamp: now_millis(),
            poll_interval,
        }
    }

    pub fn into_snapshot(self) -> BalanceSnapshot {
        BalanceSnapshot {
            total_credits: self.total_credits,
            balances: self.balances,
        }
    }
}
