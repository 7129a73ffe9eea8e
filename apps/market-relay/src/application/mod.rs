//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the normalizers and the fan-out service, plus the
//! port interfaces they use to reach links, the symbol catalog, the
//! publish/subscribe backend and kline history.

/// Port interfaces for external systems (links, catalog, pub/sub, history).
pub mod ports;

/// Tick normalizer, kline normalizer and subscription fan-out.
pub mod services;
