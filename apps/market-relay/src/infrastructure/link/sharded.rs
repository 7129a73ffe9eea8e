//! Sharded Link
//!
//! Spreads one logical symbol-scoped subscription over K identical children
//! so no single connection exceeds its practical subscription limit.
//!
//! A symbol is assigned to child `counter % K` the first time it is
//! subscribed on any channel, and keeps that child for the lifetime of the
//! sharded link, across unsubscribes and resubscribes. Unsubscribing a
//! symbol that was never assigned is a no-op.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::composite::MergedStreams;
use super::instance::{LinkGroup, LinkNode};
use crate::application::ports::MarketFeed;
use crate::domain::link::{FeedChannel, LinkEvent, LinkStatus};
use crate::domain::market::{RawKline, RawTick, Venue};
use crate::infrastructure::config::BroadcastSettings;

/// Sharded link construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    /// A sharded link needs at least one child to assign symbols to.
    #[error("sharded link {0} has no children")]
    NoChildren(String),
}

#[derive(Debug, Default)]
struct Assignments {
    by_symbol: HashMap<String, usize>,
    counter: usize,
}

/// One logical link over K children.
pub struct ShardedLink {
    id: String,
    category: String,
    venue: Venue,
    children: Vec<LinkNode>,
    assignments: Mutex<Assignments>,
    streams: MergedStreams,
}

impl ShardedLink {
    /// Create a sharded link over `children`.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::NoChildren` when `children` is empty.
    pub fn new(id: impl Into<String>, children: Vec<LinkNode>) -> Result<Self, ShardError> {
        Self::with_broadcast(id, children, &BroadcastSettings::default())
    }

    /// Create a sharded link with explicit merged-channel capacities.
    ///
    /// # Errors
    ///
    /// Returns `ShardError::NoChildren` when `children` is empty.
    pub fn with_broadcast(
        id: impl Into<String>,
        children: Vec<LinkNode>,
        broadcast: &BroadcastSettings,
    ) -> Result<Self, ShardError> {
        let id = id.into();
        let Some(first) = children.first() else {
            return Err(ShardError::NoChildren(id));
        };
        Ok(Self {
            category: first.category().to_string(),
            venue: first.venue(),
            id,
            children,
            assignments: Mutex::new(Assignments::default()),
            streams: MergedStreams::new(broadcast),
        })
    }

    /// Number of children.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.children.len()
    }

    /// Child index a symbol is assigned to, if any.
    #[must_use]
    pub fn assignment(&self, symbol: &str) -> Option<usize> {
        self.assignments.lock().by_symbol.get(symbol).copied()
    }

    /// Number of symbols assigned to each child.
    #[must_use]
    pub fn assignment_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.children.len()];
        for index in self.assignments.lock().by_symbol.values() {
            counts[*index] += 1;
        }
        counts
    }

    /// Group symbols by child, assigning unseen symbols when `assign` is set.
    fn partition(&self, symbols: &[String], assign: bool) -> BTreeMap<usize, Vec<String>> {
        let shards = self.children.len();
        let mut assignments = self.assignments.lock();
        let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for symbol in symbols {
            let index = match assignments.by_symbol.get(symbol) {
                Some(index) => *index,
                None if assign => {
                    let index = assignments.counter % shards;
                    assignments.counter += 1;
                    assignments.by_symbol.insert(symbol.clone(), index);
                    index
                }
                None => {
                    tracing::debug!(link = %self.id, symbol = %symbol, "Ignoring unassigned symbol");
                    continue;
                }
            };
            groups.entry(index).or_default().push(symbol.clone());
        }
        groups
    }
}

impl MarketFeed for ShardedLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn venue(&self) -> Venue {
        self.venue
    }

    fn subscribe(&self, channel: FeedChannel, symbols: &[String]) {
        for (index, group) in self.partition(symbols, true) {
            self.children[index].subscribe(channel, &group);
        }
    }

    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
        for (index, group) in self.partition(symbols, false) {
            self.children[index].unsubscribe(channel, &group);
        }
    }

    fn trades(&self) -> broadcast::Receiver<RawTick> {
        self.streams.trades()
    }

    fn klines(&self) -> broadcast::Receiver<RawKline> {
        self.streams.klines()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.streams.events()
    }

    fn start(&self) {
        self.streams.start(&self.children);
    }

    fn shutdown(&self) {
        self.streams.shutdown(&self.children);
    }

    fn is_ready(&self) -> bool {
        self.children.iter().all(MarketFeed::is_ready)
    }

    fn statuses(&self) -> Vec<LinkStatus> {
        self.children.iter().flat_map(MarketFeed::statuses).collect()
    }
}

impl LinkGroup for ShardedLink {
    fn children(&self) -> Vec<LinkNode> {
        self.children.clone()
    }
}
