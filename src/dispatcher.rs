//! Fans a change event out to every open connection for the affected user.

use crate::bus::ChangeHandler;
use crate::error::SnapshotError;
use crate::registry::ConnectionRegistry;
use crate::snapshot::BalanceProvider;
use crate::types::{BalanceSnapshot, ChangeEvent, ServerMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Subscribes to the change bus; on each event, re-fetches the authoritative
/// snapshot and pushes it to every locally registered connection for the
/// user.
///
/// Sends are fire-and-forget per connection, so one slow client cannot hold
/// up the bus delivery loop. A connection found closed mid-cycle (racing its
/// own disconnect) is skipped silently.
pub struct PushDispatcher {
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn BalanceProvider>,
    snapshot_timeout: Duration,
}

impl PushDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn BalanceProvider>,
        snapshot_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            provider,
            snapshot_timeout,
        })
    }

    /// Bounded snapshot fetch, shared by dispatch, the transports' initial
    /// push and the polling endpoint.
    pub async fn fetch(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError> {
        timeout(self.snapshot_timeout, self.provider.fetch_snapshot(user_id))
            .await
            .map_err(|_| SnapshotError::Timeout)?
    }

    /// A `balance_update` message carrying a fresh snapshot for the user.
    pub async fn snapshot_message(&self, user_id: &str) -> Result<ServerMessage, SnapshotError> {
        Ok(ServerMessage::balance_update(self.fetch(user_id).await?))
    }

    /// One dispatch cycle. A snapshot failure abandons the cycle (logged by
    /// the caller); the next change event or the client's polling fallback
    /// corrects any staleness.
    #[instrument(skip_all, fields(user_id = %event.user_id, kind = ?event.kind))]
    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<(), SnapshotError> {
        let connections = self.registry.connections(&event.user_id);
        if connections.is_empty() {
            debug!("no open connections, nothing to push");
            return Ok(());
        }

        let message = self.snapshot_message(&event.user_id).await?;

        let mut delivered = 0usize;
        for conn in &connections {
            if !conn.is_open() {
                debug!(conn_id = %conn.id(), "skipping closed connection");
                continue;
            }
            if conn.push(message.clone()) {
                delivered += 1;
            } else {
                debug!(conn_id = %conn.id(), "send skipped, connection closed or backlogged");
            }
        }
        debug!(delivered, total = connections.len(), "balance update pushed");
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler for PushDispatcher {
    async fn on_change(
        &self,
        event: &ChangeEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Err(e) = self.dispatch(event).await {
            warn!(user_id = %event.user_id, "dispatch cycle abandoned: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Connection;
    use crate::snapshot::InMemoryBalances;
    use crate::types::{BalanceEntry, ChangeKind, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(total: i64) -> BalanceSnapshot {
        BalanceSnapshot {
            total_credits: total,
            balances: vec![BalanceEntry {
                credit_type: "purchase".to_string(),
                amount: total,
                expiry_date: None,
            }],
        }
    }

    struct CountingProvider {
        inner: InMemoryBalances,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl BalanceProvider for CountingProvider {
        async fn fetch_snapshot(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_snapshot(user_id).await
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl BalanceProvider for FailingProvider {
        async fn fetch_snapshot(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError> {
            Err(SnapshotError::fetch(user_id, "database offline"))
        }
    }

    #[tokio::test]
    async fn every_open_connection_gets_exactly_one_fresh_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let provider = Arc::new(CountingProvider {
            inner: InMemoryBalances::new(),
            fetches: AtomicUsize::new(0),
        });
        provider.inner.set("u1", snapshot(250));

        let (a, mut rx_a) = Connection::new("u1", TransportKind::WebSocket);
        let (b, mut rx_b) = Connection::new("u1", TransportKind::Sse);
        registry.register(a);
        registry.register(b);

        let dispatcher = PushDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&provider) as Arc<dyn BalanceProvider>,
            Duration::from_secs(1),
        );
        dispatcher
            .dispatch(&ChangeEvent::new("u1", 100, ChangeKind::Purchase))
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                ServerMessage::BalanceUpdate { data, .. } => assert_eq!(data, snapshot(250)),
                other => panic!("expected balance_update, got {other:?}"),
            }
            assert!(rx.try_recv().is_err(), "exactly one message expected");
        }
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_connections_is_a_noop_without_fetching() {
        let registry = Arc::new(ConnectionRegistry::new());
        let provider = Arc::new(CountingProvider {
            inner: InMemoryBalances::new(),
            fetches: AtomicUsize::new(0),
        });
        let dispatcher = PushDispatcher::new(
            registry,
            Arc::clone(&provider) as Arc<dyn BalanceProvider>,
            Duration::from_secs(1),
        );

        dispatcher
            .dispatch(&ChangeEvent::new("ghost", 10, ChangeKind::Adjustment))
            .await
            .unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_connection_is_skipped_cleanly() {
        let registry = Arc::new(ConnectionRegistry::new());
        let provider = Arc::new(InMemoryBalances::new());
        provider.set("u1", snapshot(50));

        let (open, mut rx_open) = Connection::new("u1", TransportKind::WebSocket);
        let (closed, rx_closed) = Connection::new("u1", TransportKind::WebSocket);
        registry.register(open);
        registry.register(Arc::clone(&closed));
        drop(rx_closed);

        let dispatcher = PushDispatcher::new(
            Arc::clone(&registry),
            provider as Arc<dyn BalanceProvider>,
            Duration::from_secs(1),
        );
        dispatcher
            .dispatch(&ChangeEvent::new("u1", -10, ChangeKind::Consumption))
            .await
            .unwrap();

        assert!(matches!(
            rx_open.recv().await.unwrap(),
            ServerMessage::BalanceUpdate { .. }
        ));
        // Registry structure is untouched by the skip.
        assert_eq!(registry.connections("u1").len(), 2);
        registry.unregister("u1", closed.id());
        assert_eq!(registry.connections("u1").len(), 1);
    }

    #[tokio::test]
    async fn snapshot_failure_abandons_cycle_without_closing_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = Connection::new("u1", TransportKind::WebSocket);
        registry.register(Arc::clone(&conn));

        let dispatcher = PushDispatcher::new(
            Arc::clone(&registry),
            Arc::new(FailingProvider) as Arc<dyn BalanceProvider>,
            Duration::from_secs(1),
        );
        let result = dispatcher
            .dispatch(&ChangeEvent::new("u1", 5, ChangeKind::Purchase))
            .await;

        assert!(matches!(result, Err(SnapshotError::Fetch { .. })));
        assert!(rx.try_recv().is_err());
        assert!(conn.is_open());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        struct SlowProvider;

        #[async_trait]
        impl BalanceProvider for SlowProvider {
            async fn fetch_snapshot(
                &self,
                _user_id: &str,
            ) -> Result<BalanceSnapshot, SnapshotError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(BalanceSnapshot::default())
            }
        }

        tokio::time::pause();
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = Connection::new("u1", TransportKind::WebSocket);
        registry.register(conn);

        let dispatcher = PushDispatcher::new(
            registry,
            Arc::new(SlowProvider) as Arc<dyn BalanceProvider>,
            Duration::from_secs(5),
        );
        let result = dispatcher
            .dispatch(&ChangeEvent::new("u1", 5, ChangeKind::Purchase))
            .await;
        assert!(matches!(result, Err(SnapshotError::Timeout)));
    }
}
