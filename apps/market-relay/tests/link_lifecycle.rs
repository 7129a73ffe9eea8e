//! Link Lifecycle Integration Tests
//!
//! Runs a link against a local WebSocket server: handshake, chunked
//! subscription replay, trade publication, reconnects and zombie detection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::time::timeout;

use common::{MockExchange, WAIT, binance_trade, params};
use market_relay::infrastructure::exchanges::BinanceAdapter;
use market_relay::infrastructure::link::{HeartbeatConfig, ReconnectConfig};
use market_relay::{FeedChannel, Link, LinkConfig, LinkEvent, LinkState, MarketFeed, MarketKind};

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn test_link(exchange: &MockExchange) -> Link {
    let mut config = LinkConfig::new("binance.spot", "all");
    config.subscribe_chunk_size = 2;
    config.subscribe_pacing = Duration::from_millis(20);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        ..ReconnectConfig::default()
    }
    .without_jitter();
    Link::new(
        config,
        Arc::new(BinanceAdapter::with_url(MarketKind::Spot, exchange.url())),
    )
}

async fn wait_for_resumed(events: &mut tokio::sync::broadcast::Receiver<LinkEvent>) {
    timeout(WAIT, async {
        loop {
            if let Ok(LinkEvent::Resumed { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("link did not resume");
}

// =============================================================================
// Connection and Subscription
// =============================================================================

#[tokio::test]
async fn test_desired_set_is_sent_in_chunks_on_connect() {
    let mut exchange = MockExchange::start().await;
    let link = test_link(&exchange);
    link.subscribe(
        FeedChannel::Trades,
        &symbols(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]),
    );
    link.start();

    let first = exchange.next_frame().await;
    let second = exchange.next_frame().await;

    assert_eq!(first.frame["method"], "SUBSCRIBE");
    assert_eq!(params(&first.frame), vec!["btcusdt@trade", "ethusdt@trade"]);
    assert_eq!(params(&second.frame), vec!["solusdt@trade"]);
    assert_eq!(link.state(), LinkState::Ready);

    link.shutdown();
    link.join().await;
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_trades_are_published_on_the_link_channel() {
    let mut exchange = MockExchange::start().await;
    let link = test_link(&exchange);
    let mut trades = link.trades();
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.start();
    exchange.next_frame().await;

    exchange.send(binance_trade("BTCUSDT", 7, "100.5", "0.2", 1_700_000_000_000));
    let tick = timeout(WAIT, trades.recv()).await.unwrap().unwrap();

    assert_eq!(tick.raw_symbol, "BTCUSDT");
    assert_eq!(tick.price, dec!(100.5));
    assert_eq!(tick.size, dec!(0.2));
    assert_eq!(tick.trade_id, "7");

    let status = link.statuses().remove(0);
    assert_eq!(status.frames_received, 1);
    assert_eq!(status.subscriptions, 1);

    link.shutdown();
    link.join().await;
}

#[tokio::test]
async fn test_only_changed_symbols_go_on_the_wire() {
    let mut exchange = MockExchange::start().await;
    let link = test_link(&exchange);
    link.start();
    exchange.wait_for_connections(1).await;
    timeout(WAIT, async {
        while !link.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.unsubscribe(FeedChannel::Trades, &symbols(&["XRPUSDT"]));
    link.unsubscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));

    let subscribe = exchange.next_frame().await;
    let unsubscribe = exchange.next_frame().await;
    assert_eq!(subscribe.frame["method"], "SUBSCRIBE");
    assert_eq!(unsubscribe.frame["method"], "UNSUBSCRIBE");
    assert_eq!(params(&unsubscribe.frame), vec!["btcusdt@trade"]);
    assert!(link.desired().is_empty());

    link.shutdown();
    link.join().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let mut exchange = MockExchange::start().await;
    let link = test_link(&exchange);
    let mut trades = link.trades();
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.start();
    exchange.next_frame().await;

    exchange.send("this is not json");
    exchange.send(binance_trade("BTCUSDT", 1, "100", "1", 1_700_000_000_000));

    assert!(timeout(WAIT, trades.recv()).await.unwrap().is_ok());
    assert_eq!(exchange.connection_count(), 1);
    assert_eq!(link.state(), LinkState::Ready);

    link.shutdown();
    link.join().await;
}

// =============================================================================
// Reconnects
// =============================================================================

#[tokio::test]
async fn test_reconnect_replays_desired_set() {
    let mut exchange = MockExchange::start().await;
    let link = test_link(&exchange);
    let mut events = link.events();
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.start();
    assert_eq!(exchange.next_frame().await.connection, 0);

    link.subscribe(FeedChannel::Trades, &symbols(&["ETHUSDT"]));
    let added = exchange.next_frame().await;
    assert_eq!(params(&added.frame), vec!["ethusdt@trade"]);

    exchange.close_latest();
    wait_for_resumed(&mut events).await;

    let replay = exchange.next_frame().await;
    assert_eq!(replay.connection, 1);
    assert_eq!(params(&replay.frame), vec!["btcusdt@trade", "ethusdt@trade"]);
    assert!(link.statuses()[0].reconnects >= 1);

    link.shutdown();
    link.join().await;
}

#[tokio::test]
async fn test_silent_connection_times_out_and_replays() {
    let mut exchange = MockExchange::start().await;
    let mut config = LinkConfig::new("binance.spot", "all");
    config.heartbeat = HeartbeatConfig::new(Duration::from_millis(50), Duration::from_millis(200));
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        ..ReconnectConfig::default()
    }
    .without_jitter();
    let link = Link::new(
        config,
        Arc::new(BinanceAdapter::with_url(MarketKind::Spot, exchange.url())),
    );
    let mut events = link.events();
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.start();
    assert_eq!(exchange.next_frame().await.connection, 0);

    exchange.mute();
    timeout(WAIT, async {
        loop {
            if let Ok(LinkEvent::StateChanged {
                state: LinkState::Degraded,
                ..
            }) = events.recv().await
            {
                return;
            }
        }
    })
    .await
    .expect("silent link was not degraded");
    wait_for_resumed(&mut events).await;

    let replay = exchange.next_frame().await;
    assert_eq!(replay.connection, 1);
    assert_eq!(params(&replay.frame), vec!["btcusdt@trade"]);
    assert!(link.statuses()[0].reconnects >= 1);

    link.shutdown();
    link.join().await;
}

#[tokio::test]
async fn test_silent_trade_symbol_forces_reconnect() {
    let mut exchange = MockExchange::start().await;
    let mut config = LinkConfig::new("binance.spot", "all");
    config.stale_trade_threshold = Some(Duration::from_millis(300));
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        ..ReconnectConfig::default()
    }
    .without_jitter();
    let link = Link::new(
        config,
        Arc::new(BinanceAdapter::with_url(MarketKind::Spot, exchange.url())),
    );
    let mut events = link.events();
    link.subscribe(FeedChannel::Trades, &symbols(&["BTCUSDT"]));
    link.start();
    exchange.next_frame().await;

    exchange.send(binance_trade("BTCUSDT", 1, "100", "1", 1_700_000_000_000));
    wait_for_resumed(&mut events).await;

    exchange.wait_for_connections(2).await;
    assert_eq!(link.statuses()[0].reconnects, 1);

    link.shutdown();
    link.join().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_backoff() {
    let exchange = MockExchange::start().await;
    let mut config = LinkConfig::new("binance.spot", "all");
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_secs(60),
        ..ReconnectConfig::default()
    }
    .without_jitter();
    let link = Link::new(
        config,
        Arc::new(BinanceAdapter::with_url(MarketKind::Spot, exchange.url())),
    );
    link.start();
    exchange.wait_for_connections(1).await;

    exchange.close_latest();
    timeout(WAIT, async {
        while link.state() != LinkState::Degraded {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    link.shutdown();
    timeout(WAIT, link.join()).await.unwrap();
    assert_eq!(link.state(), LinkState::Disconnected);
}
