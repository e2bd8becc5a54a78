//! The change bus: publishes credit change events and fans them out to every
//! subscribed server process.
//!
//! Backed by Redis Pub/Sub when a broker URL is configured. Without one, or
//! while the broker is unreachable, the bridge degrades to in-process
//! delivery: a published event is handed straight to the local subscribers,
//! preserving same-instance correctness without horizontal fan-out. Missed
//! events are acceptable because the dispatcher always re-fetches
//! authoritative state instead of replaying deltas.

use crate::types::ChangeEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A callback invoked once per received change event.
///
/// Handlers are isolated from each other: an error is logged and does not
/// stop delivery to the remaining handlers.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    async fn on_change(
        &self,
        event: &ChangeEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

type SubscriberMap = DashMap<Uuid, Arc<dyn ChangeHandler>>;

/// Unsubscribes its handler when dropped.
pub struct SubscriptionHandle {
    id: Uuid,
    subscribers: std::sync::Weak<SubscriberMap>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.id);
        }
    }
}

/// The pub/sub bridge between credit mutations and the push dispatcher.
pub struct ChangeBus {
    channel: String,
    publisher: Option<redis::Client>,
    available: AtomicBool,
    subscribers: Arc<SubscriberMap>,
}

impl ChangeBus {
    /// Connects the bridge. With a broker URL this spawns the background
    /// listener task, which subscribes to the events channel and reconnects
    /// with exponential backoff whenever the broker drops. With `None` the
    /// bus runs in single-instance mode and every publish is delivered
    /// locally.
    pub fn connect(redis_url: Option<&str>, channel: impl Into<String>) -> Arc<Self> {
        let channel = channel.into();
        let publisher = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("invalid broker URL, running single-instance: {e}");
                    None
                }
            },
            None => {
                info!("no broker configured, change bus running single-instance");
                None
            }
        };

        let bus = Arc::new(Self {
            channel,
            publisher,
            available: AtomicBool::new(false),
            subscribers: Arc::new(DashMap::new()),
        });

        if let Some(url) = redis_url
            && bus.publisher.is_some()
        {
            if let Ok(sub_client) = redis::Client::open(url) {
                info!("spawning change bus listener task");
                let bus_clone = Arc::clone(&bus);
                tokio::spawn(async move {
                    bus_clone.run_listener(sub_client).await;
                });
            }
        }

        bus
    }

    /// Whether the broker connection is currently up. When false, callers on
    /// the mutation path still publish; the event is delivered in-process.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Registers a handler invoked once per received event, in receipt order.
    /// Dropping the returned handle unsubscribes it.
    pub fn subscribe(&self, handler: Arc<dyn ChangeHandler>) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, handler);
        SubscriptionHandle {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Publishes a change event. Never fails or stalls the mutation path: a
    /// broker error is logged and the event falls back to in-process
    /// delivery so connections on this instance still get their push.
    pub async fn publish(&self, event: &ChangeEvent) {
        if self.is_available()
            && let Some(client) = &self.publisher
        {
            match self.publish_to_broker(client, event).await {
                Ok(receivers) => {
                    debug!(
                        user_id = %event.user_id,
                        receivers,
                        "change event published to broker"
                    );
                    return;
                }
                Err(e) => {
                    warn!("broker publish failed, delivering in-process: {e}");
                }
            }
        } else if self.publisher.is_some() {
            warn!("broker unavailable, delivering change event in-process");
        }

        self.deliver(event).await;
    }

    async fn publish_to_broker(
        &self,
        client: &redis::Client,
        event: &ChangeEvent,
    ) -> Result<usize, crate::error::BusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let receivers: usize = conn.publish(&self.channel, payload).await?;
        Ok(receivers)
    }

    /// Invokes every subscribed handler for one event, containing each
    /// handler's failure so it cannot block the others.
    async fn deliver(&self, event: &ChangeEvent) {
        let handlers: Vec<Arc<dyn ChangeHandler>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handler in handlers {
            if let Err(e) = handler.on_change(event).await {
                error!(user_id = %event.user_id, "change handler failed: {e}");
            }
        }
    }

    /// Background task: holds the broker subscription, delivering received
    /// events to local handlers and reconnecting with backoff on failure.
    async fn run_listener(self: Arc<Self>, client: redis::Client) {
        let mut backoff = RECONNECT_BASE;
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(e) = pubsub.subscribe(&self.channel).await {
                        error!("failed to subscribe to {}: {e}", self.channel);
                    } else {
                        info!(channel = %self.channel, "change bus listener connected");
                        self.available.store(true, Ordering::Relaxed);
                        backoff = RECONNECT_BASE;

                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            self.handle_broker_message(msg).await;
                        }
                        warn!("change bus listener stream ended");
                    }
                    self.available.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    self.available.store(false, Ordering::Relaxed);
                    warn!("change bus broker unreachable: {e}. Retrying in {backoff:?}");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    async fn handle_broker_message(&self, msg: redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to read change event payload: {e}");
                return;
            }
        };
        match serde_json::from_str::<ChangeEvent>(&payload) {
            Ok(event) => {
                debug!(user_id = %event.user_id, "change event received from broker");
                self.deliver(&event).await;
            }
            Err(e) => {
                error!("discarding malformed change event: {e}");
            }
        }
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("channel", &self.channel)
            .field("brokered", &self.publisher.is_some())
            .field("available", &self.is_available())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
