//! Endpoint Binder
//!
//! Creates the listening socket. Only creation and bind failures are fatal;
//! option, backlog and multicast join failures are logged and ignored.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::Transport;
use crate::error::ListenerError;
use crate::protocol::LISTEN_BACKLOG;

/// A freshly bound listening socket
#[derive(Debug)]
pub enum BoundSocket {
    Stream(TcpListener),
    Datagram(UdpSocket),
}

/// Binds (and rebinds) the listening endpoint
#[derive(Debug, Clone)]
pub struct EndpointBinder {
    addr: SocketAddr,
    transport: Transport,
    resolved: Option<SocketAddr>,
}

impl EndpointBinder {
    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self {
            addr,
            transport,
            resolved: None,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Address of the first successful bind, kernel-assigned port included.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.resolved
    }

    /// Create and bind a listening socket. Must be called inside a tokio runtime.
    pub fn bind(&mut self) -> Result<BoundSocket, ListenerError> {
        let addr = self.resolved.unwrap_or(self.addr);
        let socket = self.open(addr)?;

        let bound = match self.transport {
            Transport::Tcp => {
                let listener = TcpListener::from_std(socket.into()).map_err(|source| {
                    ListenerError::Socket {
                        transport: self.transport.as_str(),
                        addr,
                        source,
                    }
                })?;
                BoundSocket::Stream(listener)
            }
            Transport::Udp => {
                let socket = UdpSocket::from_std(socket.into()).map_err(|source| {
                    ListenerError::Socket {
                        transport: self.transport.as_str(),
                        addr,
                        source,
                    }
                })?;
                BoundSocket::Datagram(socket)
            }
        };

        if self.resolved.is_none() {
            let local = match &bound {
                BoundSocket::Stream(listener) => listener.local_addr(),
                BoundSocket::Datagram(socket) => socket.local_addr(),
            }
            .unwrap_or(addr);
            info!(transport = %self.transport, local = %local, "Listening endpoint bound");
            self.resolved = Some(local);
        } else {
            debug!(transport = %self.transport, local = %addr, "Listening endpoint rebound");
        }

        Ok(bound)
    }

    fn open(&self, addr: SocketAddr) -> Result<Socket, ListenerError> {
        let (ty, protocol) = match self.transport {
            Transport::Tcp => (Type::STREAM, Protocol::TCP),
            Transport::Udp => (Type::DGRAM, Protocol::UDP),
        };

        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol)).map_err(
            |source| ListenerError::Socket {
                transport: self.transport.as_str(),
                addr,
                source,
            },
        )?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "Failed to set SO_REUSEADDR");
        }

        socket
            .bind(&addr.into())
            .map_err(|source| ListenerError::Bind { addr, source })?;

        if addr.ip().is_multicast() {
            join_multicast(&socket, addr.ip());
        }

        if self.transport == Transport::Tcp {
            if let Err(e) = socket.listen(LISTEN_BACKLOG) {
                warn!(error = %e, backlog = LISTEN_BACKLOG, "listen() failed");
            }
        }

        socket.set_nonblocking(true).map_err(|source| ListenerError::Socket {
            transport: self.transport.as_str(),
            addr,
            source,
        })?;

        Ok(socket)
    }
}

/// Join the group on the default interface.
fn join_multicast(socket: &Socket, group: IpAddr) {
    let joined = match group {
        IpAddr::V4(group) => socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
    };
    match joined {
        Ok(()) => info!(group = %group, "Joined multicast group"),
        Err(e) => warn!(group = %group, error = %e, "Failed to join multicast group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rebind_reuses_assigned_port() {
        let mut binder = EndpointBinder::new("127.0.0.1:0".parse().unwrap(), Transport::Udp);
        let first = binder.bind().unwrap();
        let port = binder.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let second = binder.bind().unwrap();
        match (first, second) {
            (BoundSocket::Datagram(a), BoundSocket::Datagram(b)) => {
                assert_eq!(a.local_addr().unwrap().port(), port);
                assert_eq!(b.local_addr().unwrap().port(), port);
            }
            other => panic!("unexpected sockets: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_bind_accepts_connections() {
        let mut binder = EndpointBinder::new("127.0.0.1:0".parse().unwrap(), Transport::Tcp);
        let BoundSocket::Stream(listener) = binder.bind().unwrap() else {
            panic!("expected a stream listener");
        };
        let addr = binder.local_addr().unwrap();

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut binder = EndpointBinder::new(taken.local_addr().unwrap(), Transport::Tcp);

        let err = binder.bind().unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert!(err.is_fatal());
    }
}
