//! Sharded Link Integration Tests
//!
//! Symbol distribution across children, assignment stability and lookup of
//! nodes in a link tree.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use tokio::time::timeout;

use common::{MockExchange, WAIT, binance_trade, params};
use market_relay::infrastructure::exchanges::BinanceAdapter;
use market_relay::{
    FeedChannel, InstanceCriteria, Interval, Link, LinkConfig, LinkNode, MarketFeed, MarketKind,
    ShardedLink, find_instances,
};

fn children(k: usize, url: Option<&str>) -> Vec<Link> {
    (0..k)
        .map(|i| {
            let adapter = match url {
                Some(url) => BinanceAdapter::with_url(MarketKind::Spot, url),
                None => BinanceAdapter::new(MarketKind::Spot),
            };
            Link::new(
                LinkConfig::new(format!("binance.spot#{i}"), "all"),
                Arc::new(adapter),
            )
        })
        .collect()
}

fn sharded(links: &[Link]) -> ShardedLink {
    let nodes = links.iter().cloned().map(LinkNode::Leaf).collect();
    ShardedLink::new("binance.spot", nodes).unwrap()
}

fn universe(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("SYM{i:04}USDT")).collect()
}

// =============================================================================
// Distribution
// =============================================================================

#[test]
fn test_thousand_symbols_split_evenly_over_four_children() {
    let links = children(4, None);
    let link = sharded(&links);
    let symbols = universe(1_000);

    link.subscribe(FeedChannel::Trades, &symbols);

    assert_eq!(link.assignment_counts(), vec![250, 250, 250, 250]);
    for child in &links {
        assert_eq!(child.desired().symbols(FeedChannel::Trades).len(), 250);
    }
}

#[test]
fn test_resubscribe_reuses_original_assignment() {
    let links = children(4, None);
    let link = sharded(&links);
    let symbols = universe(1_000);
    link.subscribe(FeedChannel::Trades, &symbols);
    let before: Vec<Option<usize>> = symbols.iter().map(|s| link.assignment(s)).collect();

    link.unsubscribe(FeedChannel::Trades, &symbols[..500]);
    assert!(links.iter().all(|child| {
        child.desired().symbols(FeedChannel::Trades).len() == 125
    }));

    let mut reversed = symbols[..500].to_vec();
    reversed.reverse();
    link.subscribe(FeedChannel::Trades, &reversed);

    let after: Vec<Option<usize>> = symbols.iter().map(|s| link.assignment(s)).collect();
    assert_eq!(before, after);
    assert_eq!(link.assignment_counts(), vec![250, 250, 250, 250]);
}

#[test]
fn test_kline_subscription_follows_trade_assignment() {
    let links = children(3, None);
    let link = sharded(&links);
    let symbols = universe(6);
    link.subscribe(FeedChannel::Trades, &symbols);

    link.subscribe(FeedChannel::Klines(Interval::M5), &symbols[4..5]);

    let index = link.assignment(&symbols[4]).unwrap();
    assert!(
        links[index]
            .desired()
            .contains(FeedChannel::Klines(Interval::M5), &symbols[4])
    );
}

#[test]
fn test_unassigned_unsubscribe_reaches_no_child() {
    let links = children(2, None);
    let link = sharded(&links);

    link.unsubscribe(FeedChannel::Trades, &universe(3));

    assert_eq!(link.assignment_counts(), vec![0, 0]);
    assert!(links.iter().all(|child| child.desired().is_empty()));
}

// =============================================================================
// Tree Lookup
// =============================================================================

#[test]
fn test_find_instances_by_id_and_position() {
    let links = children(4, None);
    let root = LinkNode::group(sharded(&links));

    let by_id = find_instances(&root, &InstanceCriteria::by_id("binance.spot#2"), false);
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].id(), "binance.spot#2");

    let by_position = InstanceCriteria {
        index: Some(3),
        ..InstanceCriteria::default()
    };
    let found = find_instances(&root, &by_position, true);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), "binance.spot#3");

    assert!(find_instances(&root, &InstanceCriteria::by_id("missing"), false).is_empty());
}

#[test]
fn test_matching_group_expands_to_leaves_when_requested() {
    let links = children(2, None);
    let root = LinkNode::group(sharded(&links));

    let groups = find_instances(&root, &InstanceCriteria::by_id("binance.spot"), false);
    assert_eq!(groups.len(), 1);
    assert!(matches!(groups[0], LinkNode::Composite(_)));

    let leaves = find_instances(&root, &InstanceCriteria::by_id("binance.spot"), true);
    let ids: Vec<&str> = leaves.iter().map(MarketFeed::id).collect();
    assert_eq!(ids, vec!["binance.spot#0", "binance.spot#1"]);
}

// =============================================================================
// Live Connections
// =============================================================================

#[tokio::test]
async fn test_each_child_connects_and_trades_merge() {
    let mut exchange = MockExchange::start().await;
    let links = children(2, Some(&exchange.url()));
    let link = sharded(&links);
    let mut trades = link.trades();

    link.subscribe(
        FeedChannel::Trades,
        &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"].map(String::from),
    );
    link.start();

    let mut subscribed: Vec<Vec<String>> = vec![
        params(&exchange.next_frame().await.frame),
        params(&exchange.next_frame().await.frame),
    ];
    subscribed.sort();
    assert_eq!(
        subscribed,
        vec![
            vec!["btcusdt@trade".to_string(), "solusdt@trade".to_string()],
            vec!["ethusdt@trade".to_string(), "xrpusdt@trade".to_string()],
        ]
    );
    assert_eq!(exchange.connection_count(), 2);

    exchange.send(binance_trade("ETHUSDT", 3, "2500", "1", 1_700_000_000_000));
    let tick = timeout(WAIT, trades.recv()).await.unwrap().unwrap();
    assert_eq!(tick.raw_symbol, "ETHUSDT");

    link.shutdown();
    for child in &links {
        timeout(WAIT, child.join()).await.unwrap();
    }
}
