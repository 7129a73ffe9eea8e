//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use market_relay::{FeedChannel, LinkEvent, LinkStatus, MarketFeed, RawKline, RawTick, Venue};

/// How long a test waits for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Mock Exchange
// =============================================================================

enum Command {
    Send(String),
    Close,
}

/// A frame received by the mock exchange.
#[derive(Debug, Clone)]
pub struct Received {
    /// Connection index, in accept order.
    pub connection: usize,
    /// Parsed JSON frame.
    pub frame: Value,
}

/// Local WebSocket server speaking enough of the Binance protocol to
/// acknowledge requests.
pub struct MockExchange {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Received>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    muted_before: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockExchange {
    /// Bind to an ephemeral port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let muted_before = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        let muted = Arc::clone(&muted_before);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                let index = {
                    let mut connections = accepted.lock();
                    connections.push(command_tx);
                    connections.len() - 1
                };
                tokio::spawn(serve(
                    ws,
                    index,
                    command_rx,
                    received_tx.clone(),
                    Arc::clone(&muted),
                ));
            }
        });

        Self {
            addr,
            received,
            connections,
            muted_before,
            accept_task,
        }
    }

    /// WebSocket URL of the server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Next frame sent by any client.
    pub async fn next_frame(&mut self) -> Received {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("mock exchange stopped")
    }

    /// Send a text frame on the newest connection.
    pub fn send(&self, text: impl Into<String>) {
        if let Some(connection) = self.connections.lock().last() {
            let _ = connection.send(Command::Send(text.into()));
        }
    }

    /// Close the newest connection from the server side.
    pub fn close_latest(&self) {
        if let Some(connection) = self.connections.lock().last() {
            let _ = connection.send(Command::Close);
        }
    }

    /// Stop reading on every connection accepted so far: no acks, no pongs.
    /// Later connections are served normally.
    pub fn mute(&self) {
        self.muted_before.store(self.connection_count(), Ordering::SeqCst);
    }

    /// Wait until `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for a connection");
    }
}

impl Drop for MockExchange {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    index: usize,
    mut commands: mpsc::UnboundedReceiver<Command>,
    received: mpsc::UnboundedSender<Received>,
    muted_before: Arc<AtomicUsize>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            message = read.next(), if index >= muted_before.load(Ordering::SeqCst) => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    if let Some(id) = frame.get("id") {
                        let ack = json!({ "result": null, "id": id }).to_string();
                        let _ = write.send(Message::Text(ack.into())).await;
                    }
                    let _ = received.send(Received { connection: index, frame });
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}

/// Binance spot trade frame.
pub fn binance_trade(symbol: &str, trade_id: u64, price: &str, quantity: &str, time: i64) -> String {
    json!({
        "e": "trade",
        "E": time,
        "s": symbol,
        "t": trade_id,
        "p": price,
        "q": quantity,
        "T": time,
        "m": false
    })
    .to_string()
}

/// Stream names carried by a Binance request frame.
pub fn params(frame: &Value) -> Vec<String> {
    frame["params"]
        .as_array()
        .map(|params| {
            params
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Recording Feed
// =============================================================================

/// A subscription call observed by [`RecordingFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCall {
    /// `subscribe(channel, symbols)`
    Subscribe(FeedChannel, Vec<String>),
    /// `unsubscribe(channel, symbols)`
    Unsubscribe(FeedChannel, Vec<String>),
}

/// In-memory feed that records subscription calls.
pub struct RecordingFeed {
    venue: Venue,
    calls: Mutex<Vec<FeedCall>>,
    trades: broadcast::Sender<RawTick>,
    klines: broadcast::Sender<RawKline>,
    events: broadcast::Sender<LinkEvent>,
}

impl RecordingFeed {
    /// Create a feed for `venue`.
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            calls: Mutex::new(Vec::new()),
            trades: broadcast::channel(16).0,
            klines: broadcast::channel(16).0,
            events: broadcast::channel(16).0,
        }
    }

    /// Calls observed so far.
    pub fn calls(&self) -> Vec<FeedCall> {
        self.calls.lock().clone()
    }

    /// Number of unsubscribe calls observed so far.
    pub fn unsubscribe_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, FeedCall::Unsubscribe(..)))
            .count()
    }

    /// Publish a raw trade on the feed's trade stream.
    pub fn push_trade(&self, tick: RawTick) {
        let _ = self.trades.send(tick);
    }

    /// Emit a `Resumed` event.
    pub fn resume(&self) {
        let _ = self.events.send(LinkEvent::Resumed {
            link: "recording".to_string(),
        });
    }
}

impl MarketFeed for RecordingFeed {
    fn id(&self) -> &str {
        "recording"
    }

    fn category(&self) -> &str {
        "all"
    }

    fn venue(&self) -> Venue {
        self.venue
    }

    fn subscribe(&self, channel: FeedChannel, symbols: &[String]) {
        self.calls
            .lock()
            .push(FeedCall::Subscribe(channel, symbols.to_vec()));
    }

    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
        self.calls
            .lock()
            .push(FeedCall::Unsubscribe(channel, symbols.to_vec()));
    }

    fn trades(&self) -> broadcast::Receiver<RawTick> {
        self.trades.subscribe()
    }

    fn klines(&self) -> broadcast::Receiver<RawKline> {
        self.klines.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn start(&self) {}

    fn shutdown(&self) {}

    fn is_ready(&self) -> bool {
        true
    }

    fn statuses(&self) -> Vec<LinkStatus> {
        Vec::new()
    }
}
