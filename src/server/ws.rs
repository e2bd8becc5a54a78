//! The WebSocket push endpoint.
//!
//! Authentication happens after the upgrade so failures can be delivered as
//! a structured `error` frame before the socket closes, matching what the
//! client's message handler expects. The token travels in the `token` query
//! parameter because browsers cannot set headers on the handshake.

use crate::auth::TokenValidator;
use crate::registry::Connection;
use crate::types::{ClientMessage, ServerMessage, TransportKind, now_millis};
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, Utf8Bytes, WebSocket},
    },
    response::Response,
};
use futures_util::{
    SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::PushState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<PushState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query.token, state))
}

#[instrument(skip_all, fields(conn_id, user_id))]
async fn handle_socket(socket: WebSocket, token: Option<String>, state: PushState) {
    let (mut sink, mut stream) = socket.split();

    // Authentication is terminal for this attempt; the client's reconnect
    // logic re-runs the handshake with whatever token it holds then.
    let user_id = match token {
        Some(token) => match state.validate_token(&token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("websocket auth failed: {e}");
                send_raw(&mut sink, &ServerMessage::error(e.to_string())).await;
                let _ = sink.close().await;
                return;
            }
        },
        None => {
            warn!("websocket connect without token");
            send_raw(
                &mut sink,
                &ServerMessage::error("missing authentication token"),
            )
            .await;
            let _ = sink.close().await;
            return;
        }
    };

    let (conn, rx) = Connection::new(user_id.clone(), TransportKind::WebSocket);
    tracing::Span::current().record("conn_id", tracing::field::display(conn.id()));
    tracing::Span::current().record("user_id", tracing::field::display(&user_id));

    state.registry.register(Arc::clone(&conn));
    info!("websocket client connected");

    let writer = tokio::spawn(write_loop(sink, rx));

    conn.push(ServerMessage::connected(user_id.clone()));
    match state.dispatcher.snapshot_message(&user_id).await {
        Ok(message) => {
            conn.push(message);
        }
        Err(e) => warn!("initial balance push skipped: {e}"),
    }

    // Push-only channel: the only recognized inbound message is the
    // keepalive ping.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Ping { .. }) => {
                    conn.touch();
                    conn.push(ServerMessage::Pong {
                        timestamp: now_millis(),
                    });
                }
                Err(e) => {
                    debug!("ignoring unrecognized client message: {e}");
                }
            },
            Message::Close(_) => {
                debug!("close frame received");
                break;
            }
            _ => {}
        }
    }

    info!("websocket client disconnected");
    state.registry.unregister(conn.user_id(), conn.id());
    drop(conn);
    let _ = writer.await;
}

/// Drains the connection's outbound channel into the socket. Exits when the
/// channel closes (unregister dropped the last sender) or a write fails.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to serialize push message: {e}");
                continue;
            }
        };
        if sink.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
            debug!("websocket write failed, stopping writer");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn send_raw(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(msg)
        && sink.send(Message::Text(Utf8Bytes::from(text))).await.is_err()
    {
        debug!("could not deliver message, peer already gone");
    }
}
