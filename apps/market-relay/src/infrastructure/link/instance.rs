//! Link Instance Trees
//!
//! Links nest: a composite groups per-channel links, a sharded link groups K
//! identical children. A monitoring layer addresses any node of that tree by
//! id, category or position within its parent.
//!
//! Search rules:
//! - a matching leaf is returned
//! - a matching group is returned as-is and not descended into, unless
//!   `leaf_only` is set, in which case every leaf below it is returned
//! - a non-matching group is descended into

use std::sync::Arc;

use tokio::sync::broadcast;

use super::Link;
use crate::application::ports::MarketFeed;
use crate::domain::link::{FeedChannel, LinkEvent, LinkStatus};
use crate::domain::market::{RawKline, RawTick, Venue};

/// A link that groups other links.
pub trait LinkGroup: MarketFeed {
    /// Direct children, in construction order.
    fn children(&self) -> Vec<LinkNode>;
}

/// One node of a link tree.
#[derive(Clone)]
pub enum LinkNode {
    /// A single connection.
    Leaf(Link),
    /// A composite or sharded group.
    Composite(Arc<dyn LinkGroup>),
}

impl std::fmt::Debug for LinkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(link) => f.debug_tuple("Leaf").field(&link.id()).finish(),
            Self::Composite(group) => f.debug_tuple("Composite").field(&group.id()).finish(),
        }
    }
}

impl From<Link> for LinkNode {
    fn from(link: Link) -> Self {
        Self::Leaf(link)
    }
}

impl LinkNode {
    /// Wrap a group.
    #[must_use]
    pub fn group<G: LinkGroup + 'static>(group: G) -> Self {
        Self::Composite(Arc::new(group))
    }

    /// Whether this node is a single connection.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Every leaf below (or at) this node, depth first.
    #[must_use]
    pub fn leaves(&self) -> Vec<Link> {
        match self {
            Self::Leaf(link) => vec![link.clone()],
            Self::Composite(group) => group.children().iter().flat_map(Self::leaves).collect(),
        }
    }
}

impl MarketFeed for LinkNode {
    fn id(&self) -> &str {
        match self {
            Self::Leaf(link) => link.id(),
            Self::Composite(group) => group.id(),
        }
    }

    fn category(&self) -> &str {
        match self {
            Self::Leaf(link) => link.category(),
            Self::Composite(group) => group.category(),
        }
    }

    fn venue(&self) -> Venue {
        match self {
            Self::Leaf(link) => link.venue(),
            Self::Composite(group) => group.venue(),
        }
    }

    fn subscribe(&self, channel: FeedChannel, symbols: &[String]) {
        match self {
            Self::Leaf(link) => link.subscribe(channel, symbols),
            Self::Composite(group) => group.subscribe(channel, symbols),
        }
    }

    fn unsubscribe(&self, channel: FeedChannel, symbols: &[String]) {
        match self {
            Self::Leaf(link) => link.unsubscribe(channel, symbols),
            Self::Composite(group) => group.unsubscribe(channel, symbols),
        }
    }

    fn trades(&self) -> broadcast::Receiver<RawTick> {
        match self {
            Self::Leaf(link) => link.trades(),
            Self::Composite(group) => group.trades(),
        }
    }

    fn klines(&self) -> broadcast::Receiver<RawKline> {
        match self {
            Self::Leaf(link) => link.klines(),
            Self::Composite(group) => group.klines(),
        }
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        match self {
            Self::Leaf(link) => link.events(),
            Self::Composite(group) => group.events(),
        }
    }

    fn start(&self) {
        match self {
            Self::Leaf(link) => link.start(),
            Self::Composite(group) => group.start(),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Leaf(link) => link.shutdown(),
            Self::Composite(group) => group.shutdown(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::Leaf(link) => link.is_ready(),
            Self::Composite(group) => group.is_ready(),
        }
    }

    fn statuses(&self) -> Vec<LinkStatus> {
        match self {
            Self::Leaf(link) => link.statuses(),
            Self::Composite(group) => group.statuses(),
        }
    }
}

/// What to look for in a link tree. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceCriteria {
    /// Node id.
    pub id: Option<String>,
    /// Node category.
    pub category: Option<String>,
    /// Position within the parent group. The root has no position.
    pub index: Option<usize>,
}

impl InstanceCriteria {
    /// Match by id.
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Match by category.
    #[must_use]
    pub fn by_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::default()
        }
    }

    /// Additionally require a position within the parent.
    #[must_use]
    pub const fn at_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    fn matches(&self, node: &LinkNode, index: Option<usize>) -> bool {
        self.id.as_deref().is_none_or(|id| node.id() == id)
            && self
                .category
                .as_deref()
                .is_none_or(|category| node.category() == category)
            && self.index.is_none_or(|wanted| index == Some(wanted))
    }
}

/// Find nodes matching `criteria` in the tree rooted at `root`.
#[must_use]
pub fn find_instances(root: &LinkNode, criteria: &InstanceCriteria, leaf_only: bool) -> Vec<LinkNode> {
    let mut found = Vec::new();
    visit(root, None, criteria, leaf_only, &mut found);
    found
}

fn visit(
    node: &LinkNode,
    index: Option<usize>,
    criteria: &InstanceCriteria,
    leaf_only: bool,
    found: &mut Vec<LinkNode>,
) {
    let matched = criteria.matches(node, index);
    match node {
        LinkNode::Leaf(_) => {
            if matched {
                found.push(node.clone());
            }
        }
        LinkNode::Composite(group) => {
            if matched {
                if leaf_only {
                    found.extend(node.leaves().into_iter().map(LinkNode::Leaf));
                } else {
                    found.push(node.clone());
                }
                return;
            }
            for (position, child) in group.children().iter().enumerate() {
                visit(child, Some(position), criteria, leaf_only, found);
            }
        }
    }
}
