//! The Server-Sent-Events push endpoint.
//!
//! The same JSON messages as the WebSocket endpoint, delivered as `data:`
//! lines. Auth runs before the stream starts (401 on failure); keepalive is
//! comment frames every 15 seconds.

use crate::auth::PushAuth;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::types::{ServerMessage, TransportKind, UserId};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::PushState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Unregisters the connection when the client goes away and the stream is
/// dropped.
struct StreamGuard {
    registry: Arc<ConnectionRegistry>,
    user_id: UserId,
    conn_id: ConnectionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        info!(conn_id = %self.conn_id, user_id = %self.user_id, "sse client disconnected");
        self.registry.unregister(&self.user_id, self.conn_id);
    }
}

#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn sse_handler(
    State(state): State<PushState>,
    PushAuth(user_id): PushAuth,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (conn, mut rx) = Connection::new(user_id.clone(), TransportKind::Sse);
    let guard = StreamGuard {
        registry: Arc::clone(&state.registry),
        user_id: user_id.clone(),
        conn_id: conn.id(),
    };
    state.registry.register(Arc::clone(&conn));
    info!(conn_id = %conn.id(), "sse client connected");

    conn.push(ServerMessage::connected(user_id.clone()));
    match state.dispatcher.snapshot_message(&user_id).await {
        Ok(message) => {
            conn.push(message);
        }
        Err(e) => warn!("initial balance push skipped: {e}"),
    }

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => error!("failed to serialize push message: {e}"),
            }
        }
        debug!("sse outbound channel closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keep-alive"),
    )
}
