//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames per exchange and channel, protocol errors
//! - **Links**: state gauge and reconnect counter per link
//! - **Ticks**: normalizer outcomes and published price ticks
//! - **Fan-out**: active scopes
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::link::{ChannelKind, LinkState};
use crate::domain::market::ExchangeId;

// =============================================================================
// Installation
// =============================================================================

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Calling this more than once is a no-op.
///
/// # Errors
///
/// Returns an error if the recorder or the listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()?;

    register_metrics();
    let _ = INSTALLED.set(());
    tracing::info!(port, "Prometheus metrics listener started");
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_relay_frames_received_total",
        "Decoded records received from exchange links"
    );
    describe_counter!(
        "market_relay_protocol_errors_total",
        "Inbound frames dropped because they could not be decoded"
    );
    describe_counter!(
        "market_relay_reconnects_total",
        "Link reconnection attempts"
    );
    describe_gauge!(
        "market_relay_link_state",
        "Link state (0 disconnected, 1 connecting, 2 ready, 3 degraded, 4 shutting down)"
    );
    describe_counter!(
        "market_relay_ticks_total",
        "Raw ticks seen by the tick normalizer by outcome"
    );
    describe_counter!(
        "market_relay_price_ticks_published_total",
        "Canonical price ticks published"
    );
    describe_gauge!(
        "market_relay_fanout_scopes",
        "Registered fan-out scopes, including those pending teardown"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome of one raw tick in the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Passed the spike filter.
    Accepted,
    /// Rejected by the spike filter.
    Rejected,
    /// Accepted but no price tick was emitted.
    Suppressed,
    /// Symbol could not be resolved.
    Unresolved,
}

impl TickOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Suppressed => "suppressed",
            Self::Unresolved => "unresolved",
        }
    }
}

/// Record a decoded record received by a link.
pub fn record_frame_received(exchange: ExchangeId, channel: ChannelKind) {
    counter!(
        "market_relay_frames_received_total",
        "exchange" => exchange.as_str(),
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a dropped malformed frame.
pub fn record_protocol_error(exchange: ExchangeId) {
    counter!(
        "market_relay_protocol_errors_total",
        "exchange" => exchange.as_str()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect(link: &str) {
    counter!(
        "market_relay_reconnects_total",
        "link" => link.to_string()
    )
    .increment(1);
}

/// Update the state gauge of a link.
pub fn set_link_state(link: &str, state: LinkState) {
    gauge!(
        "market_relay_link_state",
        "link" => link.to_string()
    )
    .set(state.gauge_value());
}

/// Record a normalizer outcome.
pub fn record_tick(exchange: ExchangeId, outcome: TickOutcome) {
    counter!(
        "market_relay_ticks_total",
        "exchange" => exchange.as_str(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a published price tick.
pub fn record_price_tick_published(exchange: ExchangeId) {
    counter!(
        "market_relay_price_ticks_published_total",
        "exchange" => exchange.as_str()
    )
    .increment(1);
}

/// Update the fan-out scope gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_fanout_scopes(stream: &'static str, count: usize) {
    gauge!(
        "market_relay_fanout_scopes",
        "stream" => stream
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
