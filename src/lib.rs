//! flowgate
//!
//! Listener core of a network throughput measurement server. Accepts stream
//! and datagram test flows, exchanges protocol versions with each peer,
//! groups flows from the same host for aggregate reporting, and hands every
//! flow to a worker.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod shutdown;

pub use config::Config;
pub use connection::{Listener, StopReason};
pub use error::ListenerError;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the listener
pub type Result<T> = anyhow::Result<T>;
