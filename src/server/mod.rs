//! Axum transport servers: WebSocket, SSE and polling endpoints over one
//! shared state.

pub mod poll;
pub mod sse;
pub mod ws;

use crate::auth::{SharedValidator, TokenValidator};
use crate::config::PushConfig;
use crate::dispatcher::PushDispatcher;
use crate::error::AuthError;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use axum::{Router, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Shared state behind all three endpoints. Cheap to clone; everything it
/// holds is reference-counted.
#[derive(Clone)]
pub struct PushState {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<PushDispatcher>,
    validator: SharedValidator,
    auth_timeout: Duration,
    poll_interval_secs: u64,
}

impl PushState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<PushDispatcher>,
        validator: Arc<dyn TokenValidator>,
        config: &PushConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            validator: SharedValidator(validator),
            auth_timeout: config.auth_timeout,
            poll_interval_secs: config.poll_interval_secs,
        }
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
    }
}

/// Token validation with the connection-setup bound applied: a hung
/// identity-provider call must not stall a connection attempt.
#[async_trait]
impl TokenValidator for PushState {
    async fn validate_token(&self, token: &str) -> Result<crate::types::UserId, AuthError> {
        timeout(self.auth_timeout, self.validator.validate_token(token))
            .await
            .map_err(|_| AuthError::Timeout)?
    }
}

/// The push endpoints, ready to be merged into an application router.
pub fn router(state: PushState) -> Router {
    Router::new()
        .route("/ws/credits", get(ws::websocket_handler))
        .route("/api/credits/stream", get(sse::sse_handler))
        .route("/api/credits/balance", get(poll::poll_handler))
        .with_state(state)
}
