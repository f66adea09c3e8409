//! Group Registry Module
//!
//! Active flows keyed by peer address and the report groups they share.

pub mod manager;
pub mod types;

pub use manager::{normalize_addr, normalize_host, GroupRegistry};
pub use types::*;
