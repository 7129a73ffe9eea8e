//! Market Relay Binary
//!
//! Starts the crypto market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-relay
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_EXCHANGES`: binance | okx | bybit, comma separated (default: binance)
//! - `RELAY_MARKET`: spot | perpetual (default: spot)
//! - `RELAY_SYMBOLS`: unified symbols (default: BTC/USDT)
//! - `RELAY_KLINE_INTERVALS`: kline intervals (default: 1m)
//! - `RELAY_SHARDS`: links per sharded link (default: 1)
//! - `RELAY_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: `market_relay=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use market_relay::application::services::{
    FanoutService, KlineNormalizer, KlineWindow, ScopeSubscription, TickerConfig, TickerHandler,
    TickerSink, UpstreamInterest,
};
use market_relay::domain::link::ChannelKind;
use market_relay::infrastructure::exchanges::adapters_for;
use market_relay::infrastructure::link::{
    CompositeLink, Link, LinkConfig, LinkNode, ShardError, ShardedLink,
};
use market_relay::infrastructure::telemetry;
use market_relay::{
    CanonicalKline, CanonicalPriceTick, CanonicalTrade, InProcessBus, MarketFeed, PubSub,
    RelayConfig, StaticSymbolCatalog, Venue, init_metrics, topics,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Link status log interval.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Kline window size that triggers a trim.
const WINDOW_TRIGGER: usize = 1_500;

/// Klines kept after a trim.
const WINDOW_KEEP: usize = 1_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Relay");

    let config = RelayConfig::from_env()?;
    log_config(&config);

    if config.server.metrics_port > 0
        && let Err(e) = init_metrics(config.server.metrics_port)
    {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let shutdown_token = CancellationToken::new();

    let venues: Vec<Venue> = config
        .exchanges
        .iter()
        .map(|exchange| Venue::new(*exchange, config.market))
        .collect();
    let catalog = Arc::new(StaticSymbolCatalog::with_symbols(&venues, &config.symbols));

    // Canonical topics
    let prices: Arc<InProcessBus<CanonicalPriceTick>> =
        Arc::new(InProcessBus::new(config.broadcast.trade_capacity));
    let trades: Arc<InProcessBus<CanonicalTrade>> =
        Arc::new(InProcessBus::new(config.broadcast.trade_capacity));
    let klines: Arc<InProcessBus<CanonicalKline>> =
        Arc::new(InProcessBus::new(config.broadcast.kline_capacity));

    // Price and trade scopes both hold the venue's trade channel
    let upstream = Arc::new(UpstreamInterest::new());
    let price_fanout: FanoutService<CanonicalPriceTick> =
        FanoutService::with_upstream(catalog.clone(), upstream.clone(), config.fanout.clone());
    let trade_fanout: FanoutService<CanonicalTrade> =
        FanoutService::with_upstream(catalog.clone(), upstream.clone(), config.fanout.clone());
    let kline_fanout: FanoutService<CanonicalKline> =
        FanoutService::with_upstream(catalog.clone(), upstream, config.fanout.clone());

    let mut roots = Vec::with_capacity(venues.len());
    for venue in venues {
        let root = build_feed(venue, &config)?;
        let feed: Arc<dyn MarketFeed> = Arc::new(root.clone());

        let ticker = TickerHandler::new(
            venue,
            catalog.clone(),
            TickerConfig::from_settings(&config.ticker),
        );
        let sink = TickerSink {
            prices: prices.clone(),
            trades: trades.clone(),
        };
        tokio::spawn(ticker.run(feed.trades(), sink, shutdown_token.clone()));
        tokio::spawn(KlineNormalizer::new(venue, catalog.clone()).run(
            feed.klines(),
            klines.clone(),
            shutdown_token.clone(),
        ));

        price_fanout.attach(feed.clone(), prices.subscribe(&topics::prices(venue)));
        trade_fanout.attach(feed.clone(), trades.subscribe(&topics::trades(venue)));
        kline_fanout.attach(feed.clone(), klines.subscribe(&topics::klines(venue)));
        feed.start();

        for symbol in &config.symbols {
            match price_fanout.acquire(venue, symbol, None) {
                Ok(subscription) => {
                    tokio::spawn(log_prices(subscription, shutdown_token.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "Price scope unavailable"),
            }
            match trade_fanout.acquire(venue, symbol, None) {
                Ok(subscription) => {
                    tokio::spawn(log_block_trades(subscription, shutdown_token.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "Trade scope unavailable"),
            }
            for interval in &config.kline_intervals {
                match kline_fanout.acquire(venue, symbol, Some(*interval)) {
                    Ok(subscription) => {
                        let window =
                            KlineWindow::new(venue, symbol, *interval, WINDOW_TRIGGER, WINDOW_KEEP);
                        tokio::spawn(maintain_window(
                            window,
                            subscription,
                            shutdown_token.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "Kline scope unavailable"),
                }
            }
        }

        roots.push(root);
    }

    tokio::spawn(log_statuses(roots.clone(), shutdown_token.clone()));

    tracing::info!(links = roots.len(), "Market relay ready");

    await_shutdown(shutdown_token).await;

    price_fanout.shutdown();
    trade_fanout.shutdown();
    kline_fanout.shutdown();
    for root in &roots {
        root.shutdown();
    }
    let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        for link in roots.iter().flat_map(LinkNode::leaves) {
            link.join().await;
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!("Links did not stop within the shutdown timeout");
    }

    tracing::info!("Market relay stopped");
    Ok(())
}

/// Build the link tree serving one venue.
fn build_feed(venue: Venue, config: &RelayConfig) -> Result<LinkNode, ShardError> {
    let id = venue.to_string();
    if config.shards <= 1 {
        return Ok(build_instance(venue, &id, config));
    }

    let children = (0..config.shards)
        .map(|index| build_instance(venue, &format!("{id}#{index}"), config))
        .collect();
    Ok(LinkNode::group(ShardedLink::with_broadcast(
        id,
        children,
        &config.broadcast,
    )?))
}

/// One link, or a composite when the venue splits channels over endpoints.
fn build_instance(venue: Venue, id: &str, config: &RelayConfig) -> LinkNode {
    let mut adapters = adapters_for(venue);
    if adapters.len() == 1
        && let Some(adapter) = adapters.pop()
    {
        let link_config = LinkConfig::from_settings(id, "all", &config.link, &config.broadcast);
        return LinkNode::Leaf(Link::new(link_config, adapter));
    }

    let mut builder = CompositeLink::builder(id, "all", venue).broadcast(config.broadcast.clone());
    for adapter in adapters {
        let kinds = adapter.channel_kinds();
        let category = kinds
            .iter()
            .map(ChannelKind::as_str)
            .collect::<Vec<_>>()
            .join("+");
        let link_config = LinkConfig::from_settings(
            format!("{id}.{category}"),
            category,
            &config.link,
            &config.broadcast,
        );
        builder = builder.child(Link::new(link_config, adapter), kinds);
    }
    LinkNode::group(builder.build())
}

/// Log every price tick of one scope.
async fn log_prices(
    mut subscription: ScopeSubscription<CanonicalPriceTick>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(tick) => tracing::info!(
                    exchange = %tick.exchange,
                    symbol = %tick.symbol,
                    price = %tick.price,
                    time = tick.time,
                    "Price"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(scope = %subscription.key(), skipped, "Price logger lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Log the block trades of one scope.
async fn log_block_trades(
    mut subscription: ScopeSubscription<CanonicalTrade>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(trade) if trade.is_block => tracing::info!(
                    exchange = %trade.exchange,
                    symbol = %trade.symbol,
                    side = ?trade.side,
                    price = %trade.price,
                    amount = %trade.amount,
                    trade_id = %trade.trade_id,
                    "Block trade"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(scope = %subscription.key(), skipped, "Trade logger lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Roll a kline window forward from one scope.
async fn maintain_window(
    mut window: KlineWindow,
    mut subscription: ScopeSubscription<CanonicalKline>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(kline) => {
                    let closed = !kline.is_live;
                    window.apply_live(kline);
                    if closed {
                        tracing::debug!(
                            scope = %subscription.key(),
                            held = window.store().len(),
                            "Kline closed"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(scope = %subscription.key(), skipped, "Kline window lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Periodically log the status of every leaf link.
async fn log_statuses(roots: Vec<LinkNode>, shutdown_token: CancellationToken) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            _ = interval.tick() => {
                for status in roots.iter().flat_map(MarketFeed::statuses) {
                    tracing::info!(
                        link = %status.id,
                        state = %status.state,
                        subscriptions = status.subscriptions,
                        reconnects = status.reconnects,
                        frames = status.frames_received,
                        "Link status"
                    );
                }
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    let exchanges: Vec<&str> = config.exchanges.iter().map(|e| e.as_str()).collect();
    tracing::info!(
        exchanges = ?exchanges,
        market = %config.market,
        symbols = config.symbols.len(),
        intervals = config.kline_intervals.len(),
        shards = config.shards,
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
