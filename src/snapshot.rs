//! The seam to the external balance store.

use crate::error::SnapshotError;
use crate::types::{BalanceSnapshot, UserId};
use async_trait::async_trait;
use dashmap::DashMap;

/// Fetches the current balance snapshot for a user.
///
/// This is an external collaborator (a database RPC in production). The
/// pipeline calls it freshly for every push cycle and never trusts event
/// deltas, so implementations must return the committed state, not a cache.
#[async_trait]
pub trait BalanceProvider: Send + Sync + 'static {
    async fn fetch_snapshot(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError>;
}

/// A map-backed provider for demos and tests. Unknown users resolve to an
/// empty snapshot, mirroring a zero-balance account.
#[derive(Debug, Default)]
pub struct InMemoryBalances {
    balances: DashMap<UserId, BalanceSnapshot>,
}

impl InMemoryBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<UserId>, snapshot: BalanceSnapshot) {
        self.balances.insert(user_id.into(), snapshot);
    }
}

#[async_trait]
impl BalanceProvider for InMemoryBalances {
    async fn fetch_snapshot(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError> {
        Ok(self
            .balances
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}
