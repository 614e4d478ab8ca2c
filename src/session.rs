//! Uniform session handle over the three back-end multiplexers.
//!
//! A tagged variant instead of a trait object: construction picks the
//! back-end by protocol id, and the capability set is `open` / `accept` /
//! `num_streams` / `close` / `is_closed` / `can_take_new_request`. Streams
//! handed out are wrapped in a counting guard so `num_streams` tracks live
//! streams for the pool's selection policy.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::async_stream::{AsyncStream, Transport};
use crate::h2_client::H2ClientSession;
use crate::h2_server::H2ServerSession;
use crate::protocol::Protocol;
use crate::smux::SmuxSession;
use crate::yamux::YamuxSession;

/// Socket metadata of the underlying transport, carried past the point
/// where the byte stream itself has been wrapped in protocol layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMeta {
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl From<&Transport> for SessionMeta {
    fn from(transport: &Transport) -> Self {
        Self {
            local_addr: transport.local_addr,
            peer_addr: transport.peer_addr,
        }
    }
}

enum Backend {
    H2Client(H2ClientSession),
    H2Server(H2ServerSession),
    Smux(SmuxSession),
    Yamux(YamuxSession),
}

/// A live multiplexed session.
pub struct Session {
    backend: Backend,
    live_streams: Arc<AtomicUsize>,
}

impl Session {
    /// Build a client-side session over an established (and already
    /// protocol-wrapped) byte stream.
    pub async fn new_client(
        conn: Box<dyn AsyncStream>,
        protocol: Protocol,
        meta: &SessionMeta,
    ) -> io::Result<Self> {
        let backend = match protocol {
            Protocol::H2Mux => Backend::H2Client(H2ClientSession::new(conn).await?),
            Protocol::Smux => Backend::Smux(SmuxSession::new(conn, true)),
            Protocol::Yamux => {
                check_yamux_meta(meta);
                Backend::Yamux(YamuxSession::new(conn, true))
            }
        };
        Ok(Self {
            backend,
            live_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Build a server-side session for the protocol the client negotiated.
    pub async fn new_server(
        conn: Box<dyn AsyncStream>,
        protocol: Protocol,
        meta: &SessionMeta,
    ) -> io::Result<Self> {
        let backend = match protocol {
            Protocol::H2Mux => Backend::H2Server(H2ServerSession::new(conn).await?),
            Protocol::Smux => Backend::Smux(SmuxSession::new(conn, false)),
            Protocol::Yamux => {
                check_yamux_meta(meta);
                Backend::Yamux(YamuxSession::new(conn, false))
            }
        };
        Ok(Self {
            backend,
            live_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Open a new logical stream toward the peer.
    pub async fn open(&self) -> io::Result<Box<dyn AsyncStream>> {
        let ticket = StreamTicket::new(Arc::clone(&self.live_streams));
        match &self.backend {
            Backend::H2Client(session) => {
                let stream = session.open()?;
                Ok(Box::new(CountedStream::new(stream, ticket)))
            }
            Backend::H2Server(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot open streams on a server session",
            )),
            Backend::Smux(session) => {
                let stream = session.open().await?;
                Ok(Box::new(CountedStream::new(stream, ticket)))
            }
            Backend::Yamux(session) => {
                let stream = session.open().await?;
                Ok(Box::new(CountedStream::new(stream, ticket)))
            }
        }
    }

    /// Accept the next peer-opened stream.
    pub async fn accept(&mut self) -> io::Result<Box<dyn AsyncStream>> {
        let closed_err =
            || io::Error::new(io::ErrorKind::NotConnected, "mux session is closed");
        let counter = Arc::clone(&self.live_streams);
        match &mut self.backend {
            Backend::H2Client(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot accept streams on a client session",
            )),
            Backend::H2Server(session) => {
                let stream = session.accept().await.ok_or_else(closed_err)?;
                Ok(Box::new(CountedStream::new(stream, StreamTicket::new(counter))))
            }
            Backend::Smux(session) => {
                let stream = session.accept().await.ok_or_else(closed_err)?;
                Ok(Box::new(CountedStream::new(stream, StreamTicket::new(counter))))
            }
            Backend::Yamux(session) => {
                let stream = session.accept().await.ok_or_else(closed_err)?;
                Ok(Box::new(CountedStream::new(stream, StreamTicket::new(counter))))
            }
        }
    }

    /// Number of currently live streams handed out by this session.
    pub fn num_streams(&self) -> usize {
        self.live_streams.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        match &self.backend {
            Backend::H2Client(session) => session.is_closed(),
            Backend::H2Server(session) => session.is_closed(),
            Backend::Smux(session) => session.is_closed(),
            Backend::Yamux(session) => session.is_closed(),
        }
    }

    /// Whether the pool may place another stream on this session. H2
    /// connections refuse once the underlying connection reports closing;
    /// smux and yamux accept until closed.
    pub fn can_take_new_request(&self) -> bool {
        match &self.backend {
            Backend::H2Client(session) => session.can_take_new_request(),
            Backend::H2Server(_) => false,
            Backend::Smux(session) => !session.is_closed(),
            Backend::Yamux(session) => !session.is_closed(),
        }
    }

    pub fn close(&self) {
        match &self.backend {
            Backend::H2Client(session) => session.close(),
            Backend::H2Server(session) => session.close(),
            Backend::Smux(session) => session.close(),
            Backend::Yamux(session) => session.close(),
        }
    }
}

fn check_yamux_meta(meta: &SessionMeta) {
    if meta.local_addr.is_none() || meta.peer_addr.is_none() {
        panic!("yamux requires a transport with socket addresses, found a pipe-like connection");
    }
}

/// Decrements the session's live-stream counter when dropped.
struct StreamTicket {
    counter: Arc<AtomicUsize>,
}

impl StreamTicket {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Stream wrapper carrying a ticket for its session's live counter.
struct CountedStream<S> {
    inner: S,
    _ticket: StreamTicket,
}

impl<S> CountedStream<S> {
    fn new(inner: S, ticket: StreamTicket) -> Self {
        Self {
            inner,
            _ticket: ticket,
        }
    }
}

impl<S: Unpin> Unpin for CountedStream<S> {}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn smux_pair() -> (Session, Session) {
        let (client_io, server_io) = duplex(256 * 1024);
        let meta = SessionMeta::default();
        let client = Session::new_client(Box::new(client_io), Protocol::Smux, &meta)
            .await
            .unwrap();
        let server = Session::new_server(Box::new(server_io), Protocol::Smux, &meta)
            .await
            .unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn stream_count_tracks_live_streams() {
        let (client, mut server) = smux_pair().await;
        assert_eq!(client.num_streams(), 0);

        let mut stream = client.open().await.unwrap();
        assert_eq!(client.num_streams(), 1);
        stream.write_all(b"x").await.unwrap();

        let mut accepted = server.accept().await.unwrap();
        assert_eq!(server.num_streams(), 1);
        let mut buf = [0u8; 1];
        accepted.read_exact(&mut buf).await.unwrap();

        drop(stream);
        assert_eq!(client.num_streams(), 0);
        drop(accepted);
        assert_eq!(server.num_streams(), 0);
    }

    #[tokio::test]
    async fn h2_server_session_cannot_open() {
        let (client_io, server_io) = duplex(256 * 1024);
        let meta = SessionMeta::default();
        let (client, server) = tokio::join!(
            Session::new_client(Box::new(client_io), Protocol::H2Mux, &meta),
            Session::new_server(Box::new(server_io), Protocol::H2Mux, &meta),
        );
        let _client = client.unwrap();
        let mut server = server.unwrap();
        let err = server.open().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn smux_can_take_new_request_until_closed() {
        let (client, _server) = smux_pair().await;
        assert!(client.can_take_new_request());
        client.close();
        assert!(!client.can_take_new_request());
        assert!(client.is_closed());
    }

    #[tokio::test]
    #[should_panic(expected = "yamux requires a transport")]
    async fn yamux_rejects_pipe_transport() {
        let (client_io, _server_io) = duplex(1024);
        let _ = Session::new_client(Box::new(client_io), Protocol::Yamux, &SessionMeta::default())
            .await;
    }
}
