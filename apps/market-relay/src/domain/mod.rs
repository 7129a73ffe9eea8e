//! Domain Layer - Core market data types and pure logic.
//!
//! Nothing in this layer performs I/O. Types here are shared by the link
//! state machine, the normalizers and the fan-out service.

/// Exchange identities and raw/canonical market records.
pub mod market;

/// Windowed series store for timestamped records.
pub mod series;

/// Link lifecycle states, feed channels and desired subscriptions.
pub mod link;

/// Scope reference counting for the fan-out service.
pub mod subscription;
