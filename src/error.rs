//! Error types for the listener core

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::CodecError;

/// Errors the listener distinguishes so callers can tell fatal conditions
/// from per-flow ones.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to create {transport} socket for {addr}: {source}")]
    Socket {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("receive on listening socket failed: {0}")]
    Receive(#[source] io::Error),

    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    #[error("malformed record: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Whether the error ends the whole listening session rather than one flow.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ListenerError::Socket { .. } | ListenerError::Bind { .. } | ListenerError::Receive(_)
        )
    }
}
