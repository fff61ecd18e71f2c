//! Engine observability.
//!
//! Metrics are collected in a private Prometheus registry and rendered on demand;
//! nothing listens for incoming requests.

pub mod metrics;

pub use metrics::EngineMetrics;
