//! Error taxonomy for the push pipeline.
//!
//! Errors are contained at component boundaries: a failed dispatch never
//! propagates to crash the bus subscriber loop or other users' connections.

use thiserror::Error;

/// Connection-setup authentication failures. Terminal for the attempt; the
/// client's reconnect logic retries the whole handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,
    #[error("invalid authentication token: {0}")]
    InvalidToken(String),
    #[error("token resolution failed: {0}")]
    Resolution(String),
    #[error("token validation timed out")]
    Timeout,
}

/// Failures fetching a balance snapshot from the provider. A failed fetch
/// abandons that single push cycle; the next change event or the client's
/// polling fallback corrects staleness.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("balance lookup for user {user_id} failed: {reason}")]
    Fetch { user_id: String, reason: String },
    #[error("balance provider unavailable: {0}")]
    Unavailable(String),
    #[error("balance lookup timed out")]
    Timeout,
}

impl SnapshotError {
    pub fn fetch(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            user_id: user_id.into(),
            reason: reason.into(),
        }
    }
}

/// Change-bus failures. Publishing never fails the mutation path: on any of
/// these the bridge degrades to in-process delivery and logs a warning.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("change bus is not configured")]
    Unconfigured,
    #[error("change bus connection failed: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("failed to encode change event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Client-side transport failures. Absorbed into the selector's
/// backoff/downgrade transitions, never surfaced as a panic.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("connect timed out")]
    Timeout,
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("poll request failed: {0}")]
    PollFailed(String),
}
