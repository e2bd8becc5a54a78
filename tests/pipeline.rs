//! End-to-end tests of the server-side pipeline: bus -> dispatcher ->
//! registry -> connection channels, without a broker.

use async_trait::async_trait;
use credit_push::bus::ChangeBus;
use credit_push::dispatcher::PushDispatcher;
use credit_push::error::SnapshotError;
use credit_push::registry::{Connection, ConnectionRegistry};
use credit_push::snapshot::{BalanceProvider, InMemoryBalances};
use credit_push::types::{
    BalanceEntry, BalanceSnapshot, ChangeEvent, ChangeKind, ServerMessage, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn purchase_snapshot() -> BalanceSnapshot {
    BalanceSnapshot {
        total_credits: 250,
        balances: vec![BalanceEntry {
            credit_type: "purchase".to_string(),
            amount: 100,
            expiry_date: None,
        }],
    }
}

struct Pipeline {
    registry: Arc<ConnectionRegistry>,
    balances: Arc<InMemoryBalances>,
    bus: Arc<ChangeBus>,
    _subscription: credit_push::bus::SubscriptionHandle,
}

/// Wires the whole server side together in single-instance mode.
fn pipeline() -> Pipeline {
    let registry = Arc::new(ConnectionRegistry::new());
    let balances = Arc::new(InMemoryBalances::new());
    let dispatcher = PushDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&balances) as Arc<dyn BalanceProvider>,
        Duration::from_secs(5),
    );
    let bus = ChangeBus::connect(None, "credit:events:test");
    let subscription = bus.subscribe(dispatcher);
    Pipeline {
        registry,
        balances,
        bus,
        _subscription: subscription,
    }
}

async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within deadline")
        .expect("channel closed")
}

#[tokio::test]
async fn purchase_event_pushes_snapshot_to_websocket_connection() {
    let p = pipeline();
    p.balances.set("u1", purchase_snapshot());

    let (conn, mut rx) = Connection::new("u1", TransportKind::WebSocket);
    p.registry.register(conn);

    p.bus
        .publish(&ChangeEvent::new("u1", 100, ChangeKind::Purchase))
        .await;

    let message = recv(&mut rx).await;
    let wire = serde_json::to_value(&message).unwrap();
    assert_eq!(wire["type"], "balance_update");
    assert_eq!(
        wire["data"],
        serde_json::json!({
            "total_credits": 250,
            "balances": [
                {"credit_type": "purchase", "amount": 100, "expiry_date": null}
            ]
        })
    );
}

#[tokio::test]
async fn bus_unavailable_still_reaches_all_local_connections() {
    let p = pipeline();
    assert!(!p.bus.is_available());
    p.balances.set("u1", purchase_snapshot());

    let (ws, mut ws_rx) = Connection::new("u1", TransportKind::WebSocket);
    let (sse, mut sse_rx) = Connection::new("u1", TransportKind::Sse);
    p.registry.register(ws);
    p.registry.register(sse);

    p.bus
        .publish(&ChangeEvent::new("u1", 100, ChangeKind::Purchase))
        .await;

    for rx in [&mut ws_rx, &mut sse_rx] {
        match recv(rx).await {
            ServerMessage::BalanceUpdate { data, .. } => assert_eq!(data, purchase_snapshot()),
            other => panic!("expected balance_update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn events_for_other_users_are_not_delivered() {
    let p = pipeline();
    p.balances.set("u2", purchase_snapshot());

    let (conn, mut rx) = Connection::new("u1", TransportKind::WebSocket);
    p.registry.register(conn);

    p.bus
        .publish(&ChangeEvent::new("u2", 100, ChangeKind::Purchase))
        .await;

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unregister_racing_dispatch_never_corrupts_the_registry() {
    let p = pipeline();
    p.balances.set("u1", purchase_snapshot());

    for _ in 0..50 {
        let (conn, _rx) = Connection::new("u1", TransportKind::WebSocket);
        p.registry.register(Arc::clone(&conn));

        let registry = Arc::clone(&p.registry);
        let conn_id = conn.id();
        let unregister = tokio::spawn(async move {
            registry.unregister("u1", conn_id);
        });

        p.bus
            .publish(&ChangeEvent::new("u1", -1, ChangeKind::Consumption))
            .await;
        unregister.await.unwrap();

        assert!(!p.registry.has_user("u1") || !p.registry.connections("u1").is_empty());
        p.registry.unregister("u1", conn_id);
    }
    assert_eq!(p.registry.count(), 0);
}

#[tokio::test]
async fn provider_failure_keeps_the_subscriber_loop_alive() {
    struct FlakyProvider {
        inner: InMemoryBalances,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BalanceProvider for FlakyProvider {
        async fn fetch_snapshot(&self, user_id: &str) -> Result<BalanceSnapshot, SnapshotError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(SnapshotError::fetch(user_id, "transient outage"));
            }
            self.inner.fetch_snapshot(user_id).await
        }
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let provider = Arc::new(FlakyProvider {
        inner: InMemoryBalances::new(),
        fail: std::sync::atomic::AtomicBool::new(true),
    });
    provider.inner.set("u1", purchase_snapshot());

    let dispatcher = PushDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&provider) as Arc<dyn BalanceProvider>,
        Duration::from_secs(5),
    );
    let bus = ChangeBus::connect(None, "credit:events:test");
    let _subscription = bus.subscribe(dispatcher);

    let (conn, mut rx) = Connection::new("u1", TransportKind::WebSocket);
    registry.register(conn);

    // First event hits the failing provider: cycle abandoned, nothing sent.
    bus.publish(&ChangeEvent::new("u1", 10, ChangeKind::Adjustment))
        .await;
    assert!(rx.try_recv().is_err());

    // Provider recovers; the next event goes through on the same subscriber.
    provider.fail.store(false, std::sync::atomic::Ordering::SeqCst);
    bus.publish(&ChangeEvent::new("u1", 10, ChangeKind::Adjustment))
        .await;
    assert!(matches!(
        recv(&mut rx).await,
        ServerMessage::BalanceUpdate { .. }
    ));
}
