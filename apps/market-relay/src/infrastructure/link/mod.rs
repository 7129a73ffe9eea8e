//! Exchange Link
//!
//! One managed WebSocket connection, written once and parameterized by an
//! [`ExchangeAdapter`]. The link owns:
//!
//! - the connection lifecycle (`Disconnected -> Connecting -> Ready ->
//!   Degraded -> ...`) with exponential backoff between attempts
//! - the desired-subscription set, which outlives any single connection and
//!   is replayed after every reconnect
//! - keep-alive frames and silence detection
//! - zombie detection: a subscribed trade symbol that went quiet on a socket
//!   that still looks healthy forces a reconnect
//!
//! Decoded records are published on the link's trade and kline channels.
//!
//! # Sub-modules
//!
//! - `heartbeat`: keep-alive and silence detection
//! - `reconnect`: backoff policy
//! - `composite`: several links behind one facade
//! - `sharded`: one logical subscription spread over K links
//! - `instance`: recursive discovery over link trees

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::application::ports::MarketFeed;
use crate::domain::link::{
    ChannelKind, DesiredSubscriptions, FeedChannel, LinkEvent, LinkState, LinkStatus,
};
use crate::domain::market::{RawKline, RawTick, Venue, now_ms};
use crate::infrastructure::channel::Channel;
use crate::infrastructure::config::{BroadcastSettings, LinkSettings};
use crate::infrastructure::exchanges::{
    CodecError, ExchangeAdapter, Inbound, Operation, preview,
};
use crate::infrastructure::metrics;

/// Composite links.
pub mod composite;

/// Heartbeat manager.
pub mod heartbeat;

/// Instance discovery over link trees.
pub mod instance;

/// Reconnection policy.
pub mod reconnect;

/// Sharded links.
pub mod sharded;

pub use composite::{CompositeLink, CompositeLinkBuilder};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use instance::{InstanceCriteria, LinkGroup, LinkNode, find_instances};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use sharded::{ShardError, ShardedLink};

// =============================================================================
// Error Type
// =============================================================================

/// Reasons a connection ends.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Outbound frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No inbound traffic within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// A subscribed symbol stopped trading on a socket that is still open.
    #[error("stale trade feed for {symbol} ({silence_ms} ms without trades)")]
    StaleFeed {
        /// Raw symbol that went quiet.
        symbol: String,
        /// Silence observed.
        silence_ms: u128,
    },

    /// Server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Link id, unique within a link tree.
    pub id: String,
    /// Link category (e.g. `trades`, `klines`, `all`).
    pub category: String,
    /// Symbols per (un)subscribe frame, before the adapter's own limit.
    pub subscribe_chunk_size: usize,
    /// Pause between consecutive (un)subscribe frames.
    pub subscribe_pacing: Duration,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Trade silence that marks the connection as a zombie.
    pub stale_trade_threshold: Option<Duration>,
    /// Capacity of the trade channel.
    pub trade_capacity: usize,
    /// Capacity of the kline channel.
    pub kline_capacity: usize,
}

impl LinkConfig {
    /// Configuration with default settings.
    #[must_use]
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self::from_settings(
            id,
            category,
            &LinkSettings::default(),
            &BroadcastSettings::default(),
        )
    }

    /// Configuration from loaded settings.
    #[must_use]
    pub fn from_settings(
        id: impl Into<String>,
        category: impl Into<String>,
        link: &LinkSettings,
        broadcast: &BroadcastSettings,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            subscribe_chunk_size: link.subscribe_chunk_size.max(1),
            subscribe_pacing: link.subscribe_pacing,
            heartbeat: HeartbeatConfig::from_link_settings(link),
            reconnect: ReconnectConfig::from_link_settings(link),
            stale_trade_threshold: link.stale_trade_threshold,
            trade_capacity: broadcast.trade_capacity,
            kline_capacity: broadcast.kline_capacity,
        }
    }
}

// =============================================================================
// Link
// =============================================================================

/// A wire operation queued while the link is ready.
#[derive(Debug)]
struct PendingOperation {
    op: Operation,
    channel: FeedChannel,
    symbols: Vec<String>,
}

struct LinkShared {
    config: LinkConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    chunk_size: usize,
    state: RwLock<LinkState>,
    desired: Mutex<DesiredSubscriptions>,
    ops_tx: mpsc::UnboundedSender<PendingOperation>,
    ops_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingOperation>>>,
    trades: Channel<RawTick>,
    klines: Channel<RawKline>,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    ever_ready: AtomicBool,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    last_frame_ms: AtomicI64,
}

/// One managed WebSocket connection.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.shared.config.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Create a link. Nothing connects until [`MarketFeed::start`].
    #[must_use]
    pub fn new(config: LinkConfig, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        let chunk_size = adapter
            .max_symbols_per_frame()
            .map_or(config.subscribe_chunk_size, |max| {
                config.subscribe_chunk_size.min(max)
            })
            .max(1);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(LinkShared {
                trades: Channel::new(config.trade_capacity),
                klines: Channel::new(config.kline_capacity),
                events: broadcast::channel(64).0,
                config,
                adapter,
                chunk_size,
                state: RwLock::new(LinkState::Disconnected),
                desired: Mutex::new(DesiredSubscriptions::new()),
                ops_tx,
                ops_rx: Mutex::new(Some(ops_rx)),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                started: AtomicBool::new(false),
                ever_ready: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                last_frame_ms: AtomicI64::new(0),
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.shared.state.read()
    }

    /// Effective symbols per (un)subscribe frame.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Snapshot of the desired-subscription set.
    #[must_use]
    pub fn desired(&self) -> DesiredSubscriptions {
        self.shared.desired.lock().clone()
    }

    /// Channel kinds this link can serve.
    #[must_use]
    pub fn channel_kinds(&self) -> &'static [ChannelKind] {
        self.shared.adapter.channel_kinds()
    }

    /// Wait for the connection task to finish after shutdown.
    pub async fn join(&self) {
        let handle = self.shared.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn set_state(&self, state: LinkState) {
        {
            let mut current = self.shared.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        let id = &self.shared.config.id;
        tracing::info!(link = %id, state = %state, "Link state changed");
        metrics::set_link_state(id, state);
        let _ = self.shared.events.send(LinkEvent::StateChanged {
            link: id.clone(),
            state,
        });
    }

    fn update_desired(&self, op: Operation, channel: FeedChannel, symbols: &[String]) {
        let mut desired = self.shared.desired.lock();
        let changed = match op {
            Operation::Subscribe => desired.insert(channel, symbols),
            Operation::Unsubscribe => desired.remove(channel, symbols),
        };
        if changed.is_empty() || self.state() != LinkState::Ready {
            return;
        }
        let _ = self.shared.ops_tx.send(PendingOperation {
            op,
            channel,
            symbols: changed,
        });
    }

    /// Encode one operation into paced frames.
    fn encode(&self, pending: &PendingOperation, outbound: &mut VecDeque<String>) {
        for chunk in pending.symbols.chunks(self.shared.chunk_size) {
            match self
                .shared
                .adapter
                .operation_frame(pending.op, pending.channel, chunk)
            {
                Ok(frame) => outbound.push_back(frame),
                Err(e) => tracing::warn!(
                    link = %self.shared.config.id,
                    channel = %pending.channel,
                    error = %e,
                    "Dropping subscription operation"
                ),
            }
        }
    }

    // =========================================================================
    // Connection Loop
    // =========================================================================

    async fn run(self, mut ops_rx: mpsc::UnboundedReceiver<PendingOperation>) {
        let mut policy = ReconnectPolicy::new(self.shared.config.reconnect.clone());
        let id = self.shared.config.id.clone();

        loop {
            if self.shared.cancel.is_cancelled() {
                break;
            }

            match self.connect_and_run(&mut policy, &mut ops_rx).await {
                Ok(()) => break,
                Err(e) => {
                    if self.shared.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!(link = %id, error = %e, "Link connection error");
                    self.set_state(LinkState::Degraded);

                    let Some(delay) = policy.next_delay() else {
                        tracing::error!(
                            link = %id,
                            error = %LinkError::MaxReconnectAttemptsExceeded,
                            "Link giving up"
                        );
                        break;
                    };
                    let attempt = policy.attempt_count();
                    self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    metrics::record_reconnect(&id);
                    tracing::info!(
                        link = %id,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting link"
                    );

                    tokio::select! {
                        () = self.shared.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected);
    }

    /// Connect and run until error or cancellation.
    async fn connect_and_run(
        &self,
        policy: &mut ReconnectPolicy,
        ops_rx: &mut mpsc::UnboundedReceiver<PendingOperation>,
    ) -> Result<(), LinkError> {
        let config = &self.shared.config;
        let adapter = &self.shared.adapter;

        self.set_state(LinkState::Connecting);
        tracing::info!(link = %config.id, url = adapter.url(), "Connecting link");

        let connected = tokio::select! {
            () = self.shared.cancel.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(adapter.url()) => connected,
        };
        let (ws_stream, _response) = connected?;
        let (mut write, mut read) = ws_stream.split();

        // Ready and the replay snapshot are taken under the desired lock, so a
        // concurrent subscribe either lands in the snapshot or is queued.
        let mut outbound = VecDeque::new();
        {
            let desired = self.shared.desired.lock();
            while ops_rx.try_recv().is_ok() {}
            self.set_state(LinkState::Ready);
            for (channel, symbols) in desired.snapshot() {
                self.encode(
                    &PendingOperation {
                        op: Operation::Subscribe,
                        channel,
                        symbols,
                    },
                    &mut outbound,
                );
            }
        }
        policy.reset();
        if self.shared.ever_ready.swap(true, Ordering::SeqCst) {
            tracing::info!(link = %config.id, "Link resumed");
            let _ = self.shared.events.send(LinkEvent::Resumed {
                link: config.id.clone(),
            });
        }

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = self.shared.cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                config.heartbeat.clone(),
                heartbeat_state.clone(),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let _heartbeat_guard = heartbeat_cancel.drop_guard();

        let stale_threshold = config.stale_trade_threshold;
        let check_period = stale_threshold
            .map_or(Duration::from_secs(3_600), |threshold| {
                (threshold / 6).max(Duration::from_millis(100))
            });
        let mut stale_check = tokio::time::interval(check_period);
        stale_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_trade: HashMap<String, Instant> = HashMap::new();
        let mut next_send = Instant::now();

        loop {
            tokio::select! {
                () = self.shared.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(pending) = ops_rx.recv() => {
                    self.encode(&pending, &mut outbound);
                }
                () = tokio::time::sleep_until(next_send), if !outbound.is_empty() => {
                    if let Some(frame) = outbound.pop_front() {
                        tracing::debug!(link = %config.id, frame = preview(&frame), "Sending operation");
                        write.send(Message::Text(frame.into())).await?;
                        next_send = Instant::now() + config.subscribe_pacing;
                    }
                }
                heartbeat_event = heartbeat_rx.recv() => {
                    match heartbeat_event {
                        Some(HeartbeatEvent::SendPing) => {
                            let frame = adapter
                                .ping_frame()
                                .map_or_else(|| Message::Ping(Vec::new().into()), |text| Message::Text(text.into()));
                            write.send(frame).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => return Err(LinkError::HeartbeatTimeout),
                        None => {
                            tracing::debug!(link = %config.id, "Heartbeat channel closed");
                        }
                    }
                }
                _ = stale_check.tick(), if stale_threshold.is_some() => {
                    if let Some(threshold) = stale_threshold {
                        self.check_stale(&mut last_trade, threshold)?;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_inbound();
                            self.handle_text(text.as_str(), &mut last_trade);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_inbound();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(link = %config.id, "Server sent close frame");
                            return Err(LinkError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            heartbeat_state.record_inbound();
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(LinkError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Fail when a subscribed trade symbol went quiet on this connection.
    fn check_stale(
        &self,
        last_trade: &mut HashMap<String, Instant>,
        threshold: Duration,
    ) -> Result<(), LinkError> {
        let desired = self.shared.desired.lock();
        last_trade.retain(|symbol, _| desired.contains(FeedChannel::Trades, symbol));
        drop(desired);

        for (symbol, at) in last_trade.iter() {
            let silence = at.elapsed();
            if silence > threshold {
                return Err(LinkError::StaleFeed {
                    symbol: symbol.clone(),
                    silence_ms: silence.as_millis(),
                });
            }
        }
        Ok(())
    }

    fn handle_text(&self, text: &str, last_trade: &mut HashMap<String, Instant>) {
        let exchange = self.shared.adapter.venue().exchange;
        let items = match self.shared.adapter.decode(text) {
            Ok(items) => items,
            Err(CodecError::Exchange { code, message }) => {
                tracing::warn!(
                    link = %self.shared.config.id,
                    code = %code,
                    message = %message,
                    "Exchange reported an error"
                );
                return;
            }
            Err(e) => {
                metrics::record_protocol_error(exchange);
                tracing::warn!(
                    link = %self.shared.config.id,
                    error = %e,
                    frame = preview(text),
                    "Malformed frame dropped"
                );
                return;
            }
        };

        for item in items {
            match item {
                Inbound::Trade(tick) => {
                    self.record_frame(ChannelKind::Trades);
                    last_trade.insert(tick.raw_symbol.clone(), Instant::now());
                    self.shared.trades.publish(tick);
                }
                Inbound::Kline(kline) => {
                    self.record_frame(ChannelKind::Klines);
                    self.shared.klines.publish(kline);
                }
                Inbound::Pong | Inbound::Ack => {
                    tracing::trace!(link = %self.shared.config.id, "Control frame");
                }
                Inbound::Ignored => {}
            }
        }
    }

    fn record_frame(&self, kind: ChannelKind) {
        self.shared.frames_received.fetch_add(1, Ordering::Relaxed);
        self.shared.last_frame_ms.store(now_ms(), Ordering::Relaxed);
        metrics::record_frame_received(self.shared.adapter.venue().exchange, kind);
    }
}

impl MarketFeed for Link {
    fn id(&self) -> &str {
        &self.shared.config.id
    }

    fn category(&self) -> &str {
        &self.shared.config.category
    }

    fn venue(&self) -> Venue {
        self.shared.adapter.venue()
    }

    fn subscribe(&self, channel: FeedChannel, symbols: &[String]) {
        self.update_desired(Operation::Subscribe, channel, symbols);
    }

    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
        self.update_desired(Operation::Unsubscribe, channel, symbols);
    }

    fn trades(&self) -> broadcast::Receiver<RawTick> {
        self.shared.trades.subscribe()
    }

    fn klines(&self) -> broadcast::Receiver<RawKline> {
        self.shared.klines.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    fn start(&self) {
        if self.shared.cancel.is_cancelled() || self.shared.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let Some(ops_rx) = self.shared.ops_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(self.clone().run(ops_rx));
        *self.shared.task.lock() = Some(handle);
    }

    fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.set_state(LinkState::ShuttingDown);
        self.shared.cancel.cancel();
        if !self.shared.started.load(Ordering::SeqCst) {
            self.set_state(LinkState::Disconnected);
        }
    }

    fn is_ready(&self) -> bool {
        self.state() == LinkState::Ready
    }

    fn statuses(&self) -> Vec<LinkStatus> {
        let venue = self.shared.adapter.venue();
        let last_frame = self.shared.last_frame_ms.load(Ordering::Relaxed);
        vec![LinkStatus {
            id: self.shared.config.id.clone(),
            category: self.shared.config.category.clone(),
            exchange: venue.exchange,
            market: venue.market,
            state: self.state(),
            subscriptions: self.shared.desired.lock().len(),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            last_frame_ms: (last_frame > 0).then_some(last_frame),
        }]
    }
}

// =============================================================================
// Tests
// =============================================================================
