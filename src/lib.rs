//! # Credit Push
//!
//! A real-time credit-balance notification pipeline built with Axum,
//! WebSockets, Server-Sent Events and Redis Pub/Sub. When a credit mutation
//! commits anywhere in the system, every connected client of the affected
//! user receives a fresh authoritative balance snapshot within one dispatch
//! cycle.
//!
//! ## Core pieces
//!
//! - **[`ConnectionRegistry`]**: per-process table of open push connections,
//!   keyed by user, shared by all transports.
//! - **[`ChangeBus`]**: Redis Pub/Sub bridge fanning change events out to
//!   every server instance, with an in-process fallback for single-instance
//!   deployments.
//! - **[`PushDispatcher`]**: subscribes to the bus, re-fetches the snapshot,
//!   pushes to every open connection of the affected user.
//! - **Transport servers**: WebSocket, SSE and polling endpoints under
//!   [`server`], sharing one authenticated state.
//! - **[`TransportSelector`]**: the client-side state machine that attempts
//!   WebSocket, degrades to SSE, then to polling, with exponential-backoff
//!   reconnects.
//!
//! Events only trigger re-fetches; they never carry state. Pushes are full
//! snapshots, so clients can apply the latest received one and ignore
//! delivery order.
//!
//! [`ConnectionRegistry`]: registry::ConnectionRegistry
//! [`ChangeBus`]: bus::ChangeBus
//! [`PushDispatcher`]: dispatcher::PushDispatcher
//! [`TransportSelector`]: client::TransportSelector

pub mod auth;
pub mod bus;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod types;

/// Public prelude for convenience.
///
/// `use credit_push::prelude::*;` pulls in the types most applications need.
pub mod prelude {
    pub use crate::auth::{JwtValidator, PushAuth, TokenResolver, TokenValidator};
    pub use crate::bus::{ChangeBus, ChangeHandler, SubscriptionHandle};
    pub use crate::client::{
        ActiveTransport, ClientState, ClientTransport, Phase, SelectorConfig, SnapshotCache,
        TokenStore, TransportSelector,
    };
    pub use crate::config::PushConfig;
    pub use crate::dispatcher::PushDispatcher;
    pub use crate::registry::{Connection, ConnectionRegistry};
    pub use crate::server::{PushState, router};
    pub use crate::snapshot::BalanceProvider;
    pub use crate::types::{
        BalanceEntry, BalanceSnapshot, ChangeEvent, ChangeKind, ServerMessage, TransportKind,
        UserId,
    };
}
