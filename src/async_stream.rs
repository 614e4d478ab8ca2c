//! The byte-stream seam shared by every layer of the crate.
//!
//! Streams cross module boundaries as `Box<dyn AsyncStream>`; the transport
//! handed in by the dialer additionally carries the socket metadata the
//! yamux back-end and the Brutal subsystem need.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::NetLocation;
use crate::protocol::{Network, TCP_TIMEOUT};

/// Object-safe byte stream: everything the wrappers need from a transport
/// or a multiplexed stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn AsyncStream>")
    }
}

/// An already-connected transport plus the socket metadata some subsystems
/// require. Pipe-like transports (tests, in-memory tunnels) leave the
/// optional fields empty.
pub struct Transport {
    pub stream: Box<dyn AsyncStream>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Raw fd of the underlying socket (unix only), used for
    /// congestion-control setsockopt calls. The fd is owned by `stream`;
    /// it stays valid for the lifetime of the session built on top.
    pub raw_fd: Option<i32>,
}

impl Transport {
    /// Wrap a plain byte stream with no socket metadata.
    pub fn from_stream<S: AsyncStream + 'static>(stream: S) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr: None,
            peer_addr: None,
            raw_fd: None,
        }
    }

    /// Wrap a connected TCP stream, capturing its addresses and fd.
    pub fn from_tcp_stream(stream: tokio::net::TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        #[cfg(unix)]
        let raw_fd = {
            use std::os::unix::io::AsRawFd;
            Some(stream.as_raw_fd())
        };
        #[cfg(not(unix))]
        let raw_fd = None;
        Self {
            stream: Box::new(stream),
            local_addr,
            peer_addr,
            raw_fd,
        }
    }

    pub fn has_socket_addrs(&self) -> bool {
        self.local_addr.is_some() && self.peer_addr.is_some()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Dials the underlying transport for new sessions.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, destination: &NetLocation) -> io::Result<Transport>;
}

/// Default dialer connecting over the system TCP stack.
#[derive(Debug, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, destination: &NetLocation) -> io::Result<Transport> {
        if network != Network::Tcp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported dial network: {}", network),
            ));
        }
        let addr = destination.to_socket_addr().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot dial unresolved hostname: {}", destination),
            )
        })?;
        let stream = tokio::time::timeout(TCP_TIMEOUT, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("dial timeout to {}", addr))
            })??;
        Ok(Transport::from_tcp_stream(stream))
    }
}
