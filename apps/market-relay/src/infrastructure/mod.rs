//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// In-memory symbol catalog.
pub mod catalog;

/// Broadcast channels, forwarders and the in-process bus.
pub mod channel;

/// Configuration loading.
pub mod config;

/// Exchange wire protocol adapters.
pub mod exchanges;

/// Exchange links: single, composite and sharded.
pub mod link;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
