//! Scope Subscription Bookkeeping
//!
//! Reference counting of consumer interest per scope, where a scope is one
//! (venue, symbol[, interval]) tuple. Each scope owns a handle (the fan-out
//! service stores its broadcast sender there) plus the set of clients holding
//! it and, once the last client leaves, a pending teardown ticket.
//!
//! # Design
//!
//! The registry tracks:
//! - Which clients currently hold each scope
//! - Whether a scope is waiting out its teardown delay
//! - Which scopes need replay after an upstream reconnect
//!
//! A teardown only completes when its ticket is still the pending one and no
//! client has rejoined in between; a fresh acquisition simply clears the
//! ticket, so a late timer finds nothing to do.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::domain::link::FeedChannel;
use crate::domain::market::{Interval, Venue};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a scope client.
pub type ClientId = u64;

/// Identity of one fan-out scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    /// Exchange and market.
    pub venue: Venue,
    /// Unified symbol (`BASE/QUOTE`).
    pub symbol: String,
    /// Kline interval; `None` for trade/price scopes.
    pub interval: Option<Interval>,
}

impl ScopeKey {
    /// Create a scope key.
    #[must_use]
    pub fn new(venue: Venue, symbol: impl Into<String>, interval: Option<Interval>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            interval,
        }
    }

    /// Upstream channel serving this scope.
    #[must_use]
    pub const fn channel(&self) -> FeedChannel {
        match self.interval {
            Some(interval) => FeedChannel::Klines(interval),
            None => FeedChannel::Trades,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(interval) => write!(f, "{}:{}:{interval}", self.venue, self.symbol),
            None => write!(f, "{}:{}", self.venue, self.symbol),
        }
    }
}

/// Outcome of acquiring a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// First interest in the scope; upstream must be subscribed.
    Created,
    /// Scope already existed.
    Joined {
        /// Teardown ticket that this acquisition cancelled, if one was pending.
        cancelled_teardown: Option<u64>,
    },
}

// =============================================================================
// Scope Registry
// =============================================================================

#[derive(Debug)]
struct ScopeEntry<H> {
    handle: H,
    clients: HashSet<ClientId>,
    pending_teardown: Option<u64>,
}

/// Registry of scopes and the clients holding them.
#[derive(Debug)]
pub struct ScopeRegistry<H> {
    scopes: HashMap<ScopeKey, ScopeEntry<H>>,
    next_ticket: u64,
}

impl<H> Default for ScopeRegistry<H> {
    fn default() -> Self {
        Self {
            scopes: HashMap::new(),
            next_ticket: 0,
        }
    }
}

impl<H> ScopeRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to a scope, creating the scope with `make` if needed.
    pub fn acquire(
        &mut self,
        key: &ScopeKey,
        client: ClientId,
        make: impl FnOnce() -> H,
    ) -> (Acquisition, &H) {
        match self.scopes.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.clients.insert(client);
                let cancelled_teardown = entry.pending_teardown.take();
                (Acquisition::Joined { cancelled_teardown }, &entry.handle)
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(ScopeEntry {
                    handle: make(),
                    clients: HashSet::from([client]),
                    pending_teardown: None,
                });
                (Acquisition::Created, &entry.handle)
            }
        }
    }

    /// Remove a client from a scope.
    ///
    /// Returns a teardown ticket when this was the last client.
    pub fn release(&mut self, key: &ScopeKey, client: ClientId) -> Option<u64> {
        let entry = self.scopes.get_mut(key)?;
        if !entry.clients.remove(&client) || !entry.clients.is_empty() {
            return None;
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        entry.pending_teardown = Some(ticket);
        Some(ticket)
    }

    /// Delete a scope whose teardown ticket is still pending.
    ///
    /// Returns the scope's handle when the scope was deleted.
    pub fn complete_teardown(&mut self, key: &ScopeKey, ticket: u64) -> Option<H> {
        let entry = self.scopes.get(key)?;
        if entry.pending_teardown != Some(ticket) || !entry.clients.is_empty() {
            return None;
        }
        self.scopes.remove(key).map(|entry| entry.handle)
    }

    /// Handle of a scope.
    #[must_use]
    pub fn get(&self, key: &ScopeKey) -> Option<&H> {
        self.scopes.get(key).map(|entry| &entry.handle)
    }

    /// Number of clients holding a scope.
    #[must_use]
    pub fn client_count(&self, key: &ScopeKey) -> usize {
        self.scopes.get(key).map_or(0, |entry| entry.clients.len())
    }

    /// Whether a scope is waiting out its teardown delay.
    #[must_use]
    pub fn is_pending_teardown(&self, key: &ScopeKey) -> bool {
        self.scopes
            .get(key)
            .is_some_and(|entry| entry.pending_teardown.is_some())
    }

    /// Scopes with at least one client.
    #[must_use]
    pub fn live_scopes(&self) -> Vec<ScopeKey> {
        self.scopes
            .iter()
            .filter(|(_, entry)| !entry.clients.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of registered scopes, including those pending teardown.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether no scope is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Remove every scope, returning each key with its handle.
    pub fn drain(&mut self) -> Vec<(ScopeKey, H)> {
        self.scopes
            .drain()
            .map(|(key, entry)| (key, entry.handle))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
