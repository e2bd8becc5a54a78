//! Runnable demo of the full pipeline: WebSocket/SSE/polling endpoints plus
//! a mutation route that publishes change events through the bus.
//!
//! ```sh
//! cargo run --example balance_server
//! # in another terminal:
//! websocat "ws://127.0.0.1:3000/ws/credits?token=user:alice"
//! curl -X POST 127.0.0.1:3000/demo/credits/alice -H 'content-type: application/json' -d '{"amount":100}'
//! ```
//!
//! Set `REDIS_URL` to exercise cross-instance fan-out; without it the bus
//! runs single-instance. Set `JWT_SECRET` to require real HS256 tokens
//! instead of the demo `user:<id>` format.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use credit_push::error::AuthError;
use credit_push::prelude::*;
use credit_push::snapshot::InMemoryBalances;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Accepts `user:<id>` tokens so the demo works without any configuration.
struct DemoTokenValidator;

#[async_trait]
impl TokenValidator for DemoTokenValidator {
    async fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        token
            .strip_prefix("user:")
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| AuthError::InvalidToken("expected 'user:<id>'".to_string()))
    }
}

#[derive(Clone)]
struct DemoState {
    balances: Arc<InMemoryBalances>,
    bus: Arc<ChangeBus>,
}

#[derive(serde::Deserialize)]
struct GrantRequest {
    amount: i64,
}

async fn grant_credits(
    Path(user_id): Path<String>,
    State(state): State<DemoState>,
    Json(request): Json<GrantRequest>,
) -> Json<serde_json::Value> {
    let mut snapshot = state.balances.fetch_snapshot(&user_id).await.unwrap();
    snapshot.total_credits += request.amount;
    snapshot.balances.push(BalanceEntry {
        credit_type: "purchase".to_string(),
        amount: request.amount,
        expiry_date: None,
    });
    state.balances.set(user_id.clone(), snapshot);

    // The mutation committed; notify every instance's dispatcher.
    state
        .bus
        .publish(&ChangeEvent::new(user_id, request.amount, ChangeKind::Purchase))
        .await;

    Json(serde_json::json!({ "success": true }))
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "balance_server=info,credit_push=debug".into()),
        )
        .init();

    let config = PushConfig::from_env();

    let registry = Arc::new(ConnectionRegistry::new());
    let balances = Arc::new(InMemoryBalances::new());
    balances.set(
        "alice",
        BalanceSnapshot {
            total_credits: 150,
            balances: vec![BalanceEntry {
                credit_type: "subscription".to_string(),
                amount: 150,
                expiry_date: None,
            }],
        },
    );

    let dispatcher = PushDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&balances) as Arc<dyn BalanceProvider>,
        config.snapshot_timeout,
    );

    let bus = ChangeBus::connect(config.redis_url.as_deref(), config.events_channel.clone());
    let _subscription = bus.subscribe(Arc::clone(&dispatcher) as Arc<dyn ChangeHandler>);

    let validator: Arc<dyn TokenValidator> = match TokenResolver::from_config(&config) {
        Ok(resolver) => Arc::new(resolver),
        Err(_) => {
            info!("no auth configured, accepting demo tokens of the form 'user:<id>'");
            Arc::new(DemoTokenValidator)
        }
    };

    let push_state = PushState::new(registry, dispatcher, validator, &config);
    let demo_state = DemoState {
        balances,
        bus: Arc::clone(&bus),
    };

    let app = router(push_state).merge(
        Router::new()
            .route("/demo/credits/{user_id}", post(grant_credits))
            .with_state(demo_state),
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("listening on {addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await.unwrap(), app)
        .await
        .unwrap();
}
