//! Test Protocol
//!
//! Wire records exchanged with test clients and the handshake performed on
//! every new flow.

pub mod constants;
pub mod handler;
pub mod types;

pub use constants::*;
pub use handler::{HandshakeNegotiator, HandshakeOutcome};
pub use types::*;
