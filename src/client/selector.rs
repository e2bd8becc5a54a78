//! The transport-selection state machine.
//!
//! Attempts WebSocket first, falls back to SSE, falls back to polling.
//! Failures on a live transport are retried on the same transport with
//! exponential backoff until the attempt budget is exhausted, at which point
//! the selector downgrades. Downgrade is monotonic within one degrade
//! sequence; only an explicit re-initialization (login, the browser coming
//! back online) resets the chain to WebSocket.
//!
//! The machine runs as a single task driven by a command channel, with one
//! pending timer at a time. Restarting tears the timer down with the rest of
//! the session, so a newer attempt never races a stale one.

use crate::error::TransportError;
use crate::types::{BalanceSnapshot, ClientMessage, ServerMessage, UserId, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::transport::{ClientTransport, SnapshotCache, TokenStore, TransportLink};

/// Tuning for the selector. The defaults mirror the production values: five
/// attempts per transport, one-second backoff base doubling to a 30s cap, a
/// 10s connect timeout and 10s polling.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl SelectorConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base * 2u32.pow(exponent);
        delay.min(self.backoff_cap)
    }
}

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Which transport currently owns delivery. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTransport {
    WebSocket,
    Sse,
    Polling,
    None,
}

/// Observable selector state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub phase: Phase,
    pub transport: ActiveTransport,
    /// Resolved user id from the server's `connected` acknowledgement.
    pub user_id: Option<UserId>,
}

impl ClientState {
    fn idle() -> Self {
        Self {
            phase: Phase::Disconnected,
            transport: ActiveTransport::None,
            user_id: None,
        }
    }
}

/// External triggers driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorCommand {
    /// Tear down everything, reset counters, start over from WebSocket.
    Init,
    /// Network came back; same effect as `Init`.
    Online,
    /// Network lost; tear down without scheduling a reconnect.
    Offline,
    /// Auth token replaced (new login); same effect as `Init`.
    TokenChanged,
    Shutdown,
}

/// Handle to a running selector task.
pub struct TransportSelector {
    cmd_tx: mpsc::Sender<SelectorCommand>,
    state_rx: watch::Receiver<ClientState>,
    snapshot_rx: watch::Receiver<Option<BalanceSnapshot>>,
    worker: JoinHandle<()>,
}

impl TransportSelector {
    /// Spawns the selector task. It starts idle; call
    /// [`init_connection`](Self::init_connection) to begin.
    pub fn spawn(
        transport: Arc<dyn ClientTransport>,
        tokens: Arc<dyn TokenStore>,
        cache: Arc<dyn SnapshotCache>,
        config: SelectorConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ClientState::idle());
        let last_snapshot = cache.load();
        let (snapshot_tx, snapshot_rx) = watch::channel(last_snapshot.clone());

        let worker = SelectorWorker {
            transport,
            tokens,
            cache,
            poll_interval: config.poll_interval,
            config,
            cmd_rx,
            state_tx,
            snapshot_tx,
            current: ClientState::idle(),
            last_snapshot,
        };
        let worker = tokio::spawn(worker.run());

        Self {
            cmd_tx,
            state_rx,
            snapshot_rx,
            worker,
        }
    }

    pub async fn init_connection(&self) {
        let _ = self.cmd_tx.send(SelectorCommand::Init).await;
    }

    pub async fn online(&self) {
        let _ = self.cmd_tx.send(SelectorCommand::Online).await;
    }

    pub async fn offline(&self) {
        let _ = self.cmd_tx.send(SelectorCommand::Offline).await;
    }

    pub async fn token_changed(&self) {
        let _ = self.cmd_tx.send(SelectorCommand::TokenChanged).await;
    }

    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(SelectorCommand::Shutdown).await;
        let _ = self.worker.await;
    }

    pub fn state(&self) -> ClientState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn snapshot(&self) -> Option<BalanceSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<BalanceSnapshot>> {
        self.snapshot_rx.clone()
    }
}

/// How a session or link ended.
enum SessionExit {
    Restart,
    Offline,
    Shutdown,
}

enum LinkExit {
    Closed,
    Interrupted(SessionExit),
}

/// Live transports in downgrade order; `None` means polling is next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveTransport {
    WebSocket,
    Sse,
}

impl LiveTransport {
    fn next(self) -> Option<Self> {
        match self {
            LiveTransport::WebSocket => Some(LiveTransport::Sse),
            LiveTransport::Sse => None,
        }
    }

    fn active(self) -> ActiveTransport {
        match self {
            LiveTransport::WebSocket => ActiveTransport::WebSocket,
            LiveTransport::Sse => ActiveTransport::Sse,
        }
    }
}

fn interrupt(cmd: Option<SelectorCommand>) -> SessionExit {
    match cmd {
        Some(SelectorCommand::Init | SelectorCommand::Online | SelectorCommand::TokenChanged) => {
            SessionExit::Restart
        }
        Some(SelectorCommand::Offline) => SessionExit::Offline,
        Some(SelectorCommand::Shutdown) | None => SessionExit::Shutdown,
    }
}

struct SelectorWorker {
    transport: Arc<dyn ClientTransport>,
    tokens: Arc<dyn TokenStore>,
    cache: Arc<dyn SnapshotCache>,
    config: SelectorConfig,
    cmd_rx: mpsc::Receiver<SelectorCommand>,
    state_tx: watch::Sender<ClientState>,
    snapshot_tx: watch::Sender<Option<BalanceSnapshot>>,
    current: ClientState,
    last_snapshot: Option<BalanceSnapshot>,
    /// Current polling cadence; overridden by the server's hint.
    poll_interval: Duration,
}

impl SelectorWorker {
    async fn run(mut self) {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return;
            };
            match cmd {
                SelectorCommand::Init
                | SelectorCommand::Online
                | SelectorCommand::TokenChanged => loop {
                    match self.run_session().await {
                        SessionExit::Restart => continue,
                        SessionExit::Offline => {
                            info!("offline, tearing down without reconnect");
                            self.go_idle();
                            break;
                        }
                        SessionExit::Shutdown => {
                            self.go_idle();
                            return;
                        }
                    }
                },
                SelectorCommand::Offline => self.go_idle(),
                SelectorCommand::Shutdown => return,
            }
        }
    }

    /// One full degrade sequence, from the highest-priority transport down
    /// to polling. Returns only when interrupted by a command.
    #[instrument(skip(self))]
    async fn run_session(&mut self) -> SessionExit {
        self.current.user_id = None;
        self.poll_interval = self.config.poll_interval;

        let mut live = if self.tokens.token().is_some() {
            Some(LiveTransport::WebSocket)
        } else {
            info!("no auth token stored, starting with polling");
            None
        };
        let mut attempts: u32 = 0;

        loop {
            let Some(choice) = live else {
                return self.run_polling().await;
            };

            let Some(token) = self.tokens.token() else {
                info!("auth token gone, downgrading to polling");
                live = None;
                continue;
            };

            let phase = if attempts == 0 {
                Phase::Connecting
            } else {
                Phase::Reconnecting
            };
            self.set_state(phase, choice.active());

            match self.try_connect(choice, &token).await {
                Ok(link) => {
                    info!(transport = ?choice, "transport connected");
                    self.set_state(Phase::Connected, choice.active());
                    attempts = 0;
                    match self.run_link(link, choice).await {
                        LinkExit::Interrupted(exit) => return exit,
                        LinkExit::Closed => warn!(transport = ?choice, "transport closed unexpectedly"),
                    }
                }
                Err(e) => warn!(transport = ?choice, "connect failed: {e}"),
            }

            attempts += 1;
            if attempts >= self.config.max_attempts {
                live = choice.next();
                info!(from = ?choice, to = ?live, "retry budget exhausted, downgrading");
                attempts = 0;
            } else {
                let delay = self.config.backoff_delay(attempts);
                debug!(attempt = attempts, ?delay, "scheduling reconnect");
                self.set_state(Phase::Reconnecting, choice.active());
                if let Some(exit) = self.interruptible_sleep(delay).await {
                    return exit;
                }
            }
        }
    }

    async fn try_connect(
        &self,
        choice: LiveTransport,
        token: &str,
    ) -> Result<TransportLink, TransportError> {
        let connect = async {
            match choice {
                LiveTransport::WebSocket => self.transport.connect_websocket(token).await,
                LiveTransport::Sse => self.transport.connect_sse(token).await,
            }
        };
        tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Pumps an established live connection until it closes or a command
    /// interrupts. Sends keepalive pings on WebSocket only.
    async fn run_link(&mut self, mut link: TransportLink, choice: LiveTransport) -> LinkExit {
        let send_pings = choice == LiveTransport::WebSocket;
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );

        loop {
            tokio::select! {
                msg = link.incoming.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => return LinkExit::Closed,
                },
                _ = ping.tick(), if send_pings => {
                    let ping_msg = ClientMessage::Ping { timestamp: now_millis() };
                    if link.outgoing.try_send(ping_msg).is_err() {
                        debug!("keepalive ping not sent");
                    }
                }
                cmd = self.cmd_rx.recv() => return LinkExit::Interrupted(interrupt(cmd)),
            }
        }
    }

    /// Terminal fallback. Never downgrades further; failed polls are retried
    /// at the next tick.
    async fn run_polling(&mut self) -> SessionExit {
        info!("entering polling mode");
        self.set_state(Phase::Connected, ActiveTransport::Polling);

        loop {
            let token = self.tokens.token();
            match self.transport.poll(token.as_deref()).await {
                Ok(data) => {
                    if data.poll_interval > 0 {
                        self.poll_interval = Duration::from_secs(data.poll_interval);
                    }
                    self.apply_snapshot(data.into_snapshot());
                }
                Err(e) => warn!("poll failed, retrying next tick: {e}"),
            }
            if let Some(exit) = self.interruptible_sleep(self.poll_interval).await {
                return exit;
            }
        }
    }

    /// The single pending timer. A command arriving during the wait cancels
    /// it as a unit.
    async fn interruptible_sleep(&mut self, delay: Duration) -> Option<SessionExit> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            cmd = self.cmd_rx.recv() => Some(interrupt(cmd)),
        }
    }

    fn handle_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Connected { user_id, .. } => {
                info!(%user_id, "connection acknowledged");
                self.current.user_id = Some(user_id);
                let _ = self.state_tx.send(self.current.clone());
            }
            ServerMessage::BalanceUpdate { data, .. } => self.apply_snapshot(data),
            ServerMessage::Pong { .. } => debug!("pong received"),
            ServerMessage::Error { message } => warn!("server reported error: {message}"),
        }
    }

    fn apply_snapshot(&mut self, snapshot: BalanceSnapshot) {
        if self.last_snapshot.as_ref() == Some(&snapshot) {
            debug!("snapshot unchanged, skipping");
            return;
        }
        self.cache.store(&snapshot);
        self.last_snapshot = Some(snapshot.clone());
        let _ = self.snapshot_tx.send(Some(snapshot));
    }

    fn set_state(&mut self, phase: Phase, transport: ActiveTransport) {
        self.current.phase = phase;
        self.current.transport = transport;
        let _ = self.state_tx.send(self.current.clone());
    }

    fn go_idle(&mut self) {
        self.current = ClientState::idle();
        let _ = self.state_tx.send(self.current.clone());
    }
}
