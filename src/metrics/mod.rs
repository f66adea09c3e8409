//! Metrics Module
//!
//! Listener counters and their Prometheus endpoint.

pub mod collector;
pub mod server;

pub use collector::Metrics;
pub use server::MetricsServer;
