//! Composite Link
//!
//! Several links behind one facade, typically one per channel kind for
//! exchanges that serve trades and klines on different endpoints. Operations
//! are routed by channel kind; lifecycle calls and status collection fan out
//! to every child; child streams are merged into the composite's own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::instance::{LinkGroup, LinkNode};
use crate::application::ports::MarketFeed;
use crate::domain::link::{ChannelKind, FeedChannel, LinkEvent, LinkStatus};
use crate::domain::market::{RawKline, RawTick, Venue};
use crate::infrastructure::channel::{Channel, forward};
use crate::infrastructure::config::BroadcastSettings;

// =============================================================================
// Merged Streams
// =============================================================================

/// Output channels of a link group, fed by forwarders from every child.
pub(crate) struct MergedStreams {
    trades: Channel<RawTick>,
    klines: Channel<RawKline>,
    events: Channel<LinkEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl MergedStreams {
    pub(crate) fn new(settings: &BroadcastSettings) -> Self {
        Self {
            trades: Channel::new(settings.trade_capacity),
            klines: Channel::new(settings.kline_capacity),
            events: Channel::new(64),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn trades(&self) -> broadcast::Receiver<RawTick> {
        self.trades.subscribe()
    }

    pub(crate) fn klines(&self) -> broadcast::Receiver<RawKline> {
        self.klines.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Attach forwarders and start every child. Only the first call acts.
    pub(crate) fn start(&self, children: &[LinkNode]) {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for child in children {
            forward(child.trades(), self.trades.clone(), self.cancel.clone());
            forward(child.klines(), self.klines.clone(), self.cancel.clone());
            forward(child.events(), self.events.clone(), self.cancel.clone());
            child.start();
        }
    }

    /// Shut every child down and stop forwarding.
    pub(crate) fn shutdown(&self, children: &[LinkNode]) {
        if self.cancel.is_cancelled() {
            return;
        }
        for child in children {
            child.shutdown();
        }
        self.cancel.cancel();
    }
}

// =============================================================================
// Composite Link
// =============================================================================

/// Builder for [`CompositeLink`].
pub struct CompositeLinkBuilder {
    id: String,
    category: String,
    venue: Venue,
    children: Vec<LinkNode>,
    routes: HashMap<ChannelKind, usize>,
    broadcast: BroadcastSettings,
}

impl CompositeLinkBuilder {
    /// Capacities of the merged channels.
    #[must_use]
    pub fn broadcast(mut self, settings: BroadcastSettings) -> Self {
        self.broadcast = settings;
        self
    }

    /// Add a child serving `kinds`. The first child registered for a kind
    /// receives its operations.
    #[must_use]
    pub fn child(mut self, node: impl Into<LinkNode>, kinds: &[ChannelKind]) -> Self {
        let index = self.children.len();
        for kind in kinds {
            self.routes.entry(*kind).or_insert(index);
        }
        self.children.push(node.into());
        self
    }

    /// Build the composite.
    #[must_use]
    pub fn build(self) -> CompositeLink {
        CompositeLink {
            id: self.id,
            category: self.category,
            venue: self.venue,
            children: self.children,
            routes: self.routes,
            streams: MergedStreams::new(&self.broadcast),
        }
    }
}

/// Facade over child links routed by channel kind.
pub struct CompositeLink {
    id: String,
    category: String,
    venue: Venue,
    children: Vec<LinkNode>,
    routes: HashMap<ChannelKind, usize>,
    streams: MergedStreams,
}

impl CompositeLink {
    /// Start building a composite.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        category: impl Into<String>,
        venue: Venue,
    ) -> CompositeLinkBuilder {
        CompositeLinkBuilder {
            id: id.into(),
            category: category.into(),
            venue,
            children: Vec::new(),
            routes: HashMap::new(),
            broadcast: BroadcastSettings::default(),
        }
    }

    fn route(&self, channel: FeedChannel) -> Option<&LinkNode> {
        let child = self
            .routes
            .get(&channel.kind())
            .and_then(|index| self.children.get(*index));
        if child.is_none() {
            tracing::warn!(link = %self.id, channel = %channel, "No child serves channel");
        }
        child
    }
}

impl MarketFeed for CompositeLink {
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
        if let Some(child) = self.route(channel) {
            child.subscribe(channel, symbols);
        }
    }

    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
        if let Some(child) = self.route(channel) {
            child.unsubscribe(channel, symbols);
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
        !self.children.is_empty() && self.children.iter().all(MarketFeed::is_ready)
    }

    fn statuses(&self) -> Vec<LinkStatus> {
        self.children.iter().flat_map(MarketFeed::statuses).collect()
    }
}

impl LinkGroup for CompositeLink {
    fn children(&self) -> Vec<LinkNode> {
        self.children.clone()
    }
}
