//! Client-side transport selection: WebSocket, then SSE, then polling.

pub mod selector;
pub mod transport;

pub use selector::{
    ActiveTransport, ClientState, Phase, SelectorCommand, SelectorConfig, TransportSelector,
};
pub use transport::{
    ClientTransport, MemorySnapshotCache, MemoryTokenStore, SnapshotCache, TokenStore,
    TransportLink,
};
