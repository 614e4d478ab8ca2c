//! Server-side session runner.
//!
//! Reads the session request off a fresh connection, stands up the
//! negotiated back-end session, and runs each accepted stream in its own
//! task: read the stream request, route the Brutal meta-stream to the
//! bandwidth handler, otherwise wrap and dispatch to the application
//! handler. A handler error before the first reply byte is reported to the
//! peer as an error status.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::address::NetLocation;
use crate::async_stream::{AsyncStream, Transport};
use crate::brutal::{self, BrutalOptions, BRUTAL_AVAILABLE};
use crate::padding::PaddingStream;
use crate::protocol::{Network, SessionRequest, StreamRequest};
use crate::server_stream::{ServerPacketAddrStream, ServerPacketStream, ServerStream};
use crate::session::{Session, SessionMeta};

/// Application handler invoked for each demultiplexed stream. The wrapper
/// stays owned by the runner; the handler drives it for as long as the
/// stream should live.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle_connection(
        &self,
        conn: &mut ServerStream,
        source: NetLocation,
        destination: NetLocation,
    ) -> io::Result<()>;

    async fn handle_packet_connection(
        &self,
        conn: &mut ServerPacketConn,
        source: NetLocation,
        destination: NetLocation,
    ) -> io::Result<()>;
}

/// The two UDP server wrappers behind one dispatch surface.
pub enum ServerPacketConn {
    Fixed(ServerPacketStream),
    Addr(ServerPacketAddrStream),
}

impl ServerPacketConn {
    pub async fn read_packet_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetLocation)> {
        match self {
            ServerPacketConn::Fixed(conn) => conn.read_packet_from(buf).await,
            ServerPacketConn::Addr(conn) => conn.read_packet_from(buf).await,
        }
    }

    /// Send a packet; `source` is carried on the wire only in per-packet
    /// address mode.
    pub async fn write_packet_to(&self, payload: &[u8], source: &NetLocation) -> io::Result<()> {
        match self {
            ServerPacketConn::Fixed(conn) => conn.write_packet(payload).await,
            ServerPacketConn::Addr(conn) => conn.write_packet_to(payload, source).await,
        }
    }

    pub async fn handshake_failure(&self, message: &str) -> io::Result<()> {
        match self {
            ServerPacketConn::Fixed(conn) => conn.handshake_failure(message).await,
            ServerPacketConn::Addr(conn) => conn.handshake_failure(message).await,
        }
    }

    pub fn front_headroom(&self) -> usize {
        match self {
            ServerPacketConn::Fixed(conn) => conn.front_headroom(),
            ServerPacketConn::Addr(conn) => conn.front_headroom(),
        }
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        match self {
            ServerPacketConn::Fixed(conn) => conn.shutdown().await,
            ServerPacketConn::Addr(conn) => conn.shutdown().await,
        }
    }
}

pub struct ServiceOptions {
    pub handler: Arc<dyn ServiceHandler>,
    /// Require padding from every client.
    pub padding: bool,
    pub brutal: BrutalOptions,
}

/// Demultiplexes sessions and dispatches streams to the handler.
pub struct Service {
    handler: Arc<dyn ServiceHandler>,
    padding: bool,
    brutal: BrutalOptions,
}

impl Service {
    pub fn new(options: ServiceOptions) -> io::Result<Self> {
        if options.brutal.enabled && !BRUTAL_AVAILABLE {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TCP Brutal is only supported on Linux",
            ));
        }
        Ok(Self {
            handler: options.handler,
            padding: options.padding,
            brutal: options.brutal,
        })
    }

    /// Run one multiplexed connection to completion.
    pub async fn serve(&self, transport: Transport, source: NetLocation) -> io::Result<()> {
        let meta = SessionMeta::from(&transport);
        let session_fd = transport.raw_fd;
        let mut stream = transport.stream;

        let request = SessionRequest::read(&mut stream).await?;
        let stream: Box<dyn AsyncStream> = if request.padding {
            Box::new(PaddingStream::new(stream))
        } else if self.padding {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "non-padded connection rejected",
            ));
        } else {
            stream
        };

        debug!(
            "mux session from {} (version {}, protocol {:?}, padding {})",
            source, request.version, request.protocol, request.padding
        );

        let mut session = Session::new_server(stream, request.protocol, &meta).await?;

        let result = loop {
            match session.accept().await {
                Ok(stream) => {
                    let handler = Arc::clone(&self.handler);
                    let brutal = self.brutal;
                    let source = source.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_stream(stream, handler, brutal, session_fd, source).await
                        {
                            debug!("process multiplex stream: {}", e);
                        }
                    });
                }
                Err(e) => break e,
            }
        };
        session.close();

        // A closed session is the normal end of the accept loop.
        if result.kind() == io::ErrorKind::NotConnected {
            Ok(())
        } else {
            Err(result)
        }
    }
}

async fn handle_stream(
    mut stream: Box<dyn AsyncStream>,
    handler: Arc<dyn ServiceHandler>,
    brutal_options: BrutalOptions,
    session_fd: Option<i32>,
    source: NetLocation,
) -> io::Result<()> {
    let request = StreamRequest::read(&mut stream)
        .await
        .map_err(|e| io::Error::new(e.kind(), format!("read multiplex stream request: {}", e)))?;
    let destination = request.destination.clone();

    match request.network {
        Network::Tcp => {
            let mut conn = ServerStream::new(stream);

            if brutal::is_brutal_exchange(true, &destination) {
                let result = brutal::server_exchange(&mut conn, session_fd, &brutal_options).await;
                let _ = conn.shutdown().await;
                return result;
            }

            info!("inbound multiplex connection to {}", destination);
            let result = handler
                .handle_connection(&mut conn, source, destination)
                .await;
            if let Err(e) = &result {
                if conn.need_handshake() {
                    let _ = conn.handshake_failure(&e.to_string()).await;
                }
            }
            let _ = conn.shutdown().await;
            result
        }
        Network::Udp => {
            let mut conn = if request.packet_addr {
                info!("inbound multiplex packet connection");
                ServerPacketConn::Addr(ServerPacketAddrStream::new(stream))
            } else {
                info!("inbound multiplex packet connection to {}", destination);
                ServerPacketConn::Fixed(ServerPacketStream::new(stream, destination.clone()))
            };

            let result = handler
                .handle_packet_connection(&mut conn, source, destination)
                .await;
            if let Err(e) = &result {
                let _ = conn.handshake_failure(&e.to_string()).await;
            }
            let _ = conn.shutdown().await;
            result
        }
    }
}

/// Echo-style handler used in tests and examples: copies each stream's
/// input back to its peer.
#[doc(hidden)]
pub struct EchoHandler;

#[async_trait]
impl ServiceHandler for EchoHandler {
    async fn handle_connection(
        &self,
        conn: &mut ServerStream,
        _source: NetLocation,
        _destination: NetLocation,
    ) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
            conn.flush().await?;
        }
    }

    async fn handle_packet_connection(
        &self,
        conn: &mut ServerPacketConn,
        _source: NetLocation,
        _destination: NetLocation,
    ) -> io::Result<()> {
        let mut buf = [0u8; 65535];
        loop {
            let (n, from) = match conn.read_packet_from(&mut buf).await {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            conn.write_packet_to(&buf[..n], &from).await?;
        }
    }
}
