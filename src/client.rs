//! Client-side session pool.
//!
//! Keeps a small set of live multiplexed sessions and places each new
//! logical stream on the one with the fewest streams, opening sessions on
//! demand under the configured limits. One mutex guards the list; the
//! sweep-and-select critical section never spans IO.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use crate::address::NetLocation;
use crate::async_stream::{AsyncStream, Dialer, TcpDialer, Transport};
use crate::brutal::{self, BrutalOptions};
use crate::client_stream::{ClientPacketAddrStream, ClientPacketStream, ClientStream};
use crate::padding::PaddingStream;
use crate::protocol::{mux_destination, Network, Protocol, SessionRequest, TCP_TIMEOUT};
use crate::request_stream::RequestStream;
use crate::session::{Session, SessionMeta};

/// Pool configuration.
pub struct ClientOptions {
    pub dialer: Arc<dyn Dialer>,
    pub protocol: Protocol,
    /// Maximum pooled sessions; 0 = unlimited.
    pub max_connections: usize,
    /// Prefer an existing session while it has fewer streams than this.
    pub min_streams: usize,
    /// Open a new session once the selected one reaches this; 0 = unlimited.
    pub max_streams: usize,
    pub padding: bool,
    pub brutal: BrutalOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dialer: Arc::new(TcpDialer),
            protocol: Protocol::H2Mux,
            max_connections: 0,
            min_streams: 0,
            max_streams: 0,
            padding: false,
            brutal: BrutalOptions::default(),
        }
    }
}

/// A pooled session with its selection metadata.
struct SessionEntry {
    session: Session,
    #[allow(dead_code)]
    protocol: Protocol,
    #[allow(dead_code)]
    created_at: Instant,
}

/// A dialed connection: TCP stream or fixed-destination packet stream.
pub enum ClientConn {
    Tcp(ClientStream),
    Udp(ClientPacketStream),
}

/// Multiplexing client: dial logical streams over pooled sessions.
pub struct Client {
    dialer: Arc<dyn Dialer>,
    protocol: Protocol,
    max_connections: usize,
    min_streams: usize,
    max_streams: usize,
    padding: bool,
    brutal: BrutalOptions,
    sessions: Mutex<Vec<Arc<SessionEntry>>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let mut min_streams = options.min_streams;
        if options.max_streams == 0 && options.max_connections == 0 && min_streams == 0 {
            min_streams = 8;
        }
        Self {
            dialer: options.dialer,
            protocol: options.protocol,
            max_connections: options.max_connections,
            min_streams,
            max_streams: options.max_streams,
            padding: options.padding,
            brutal: options.brutal,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Dial a logical connection of the given network kind.
    pub async fn dial(
        &self,
        network: Network,
        destination: NetLocation,
    ) -> io::Result<ClientConn> {
        match network {
            Network::Tcp => Ok(ClientConn::Tcp(self.dial_tcp(destination).await?)),
            Network::Udp => Ok(ClientConn::Udp(self.dial_udp(destination).await?)),
        }
    }

    /// Open a TCP-like stream to `destination`.
    pub async fn dial_tcp(&self, destination: NetLocation) -> io::Result<ClientStream> {
        let stream = self.open_stream().await?;
        Ok(ClientStream::new(stream, destination))
    }

    /// Open a UDP-like stream with a fixed destination.
    pub async fn dial_udp(&self, destination: NetLocation) -> io::Result<ClientPacketStream> {
        let stream = self.open_stream().await?;
        Ok(ClientPacketStream::new(stream, destination))
    }

    /// Open a UDP-like stream where each packet carries its own address.
    pub async fn listen_packet(
        &self,
        destination: NetLocation,
    ) -> io::Result<ClientPacketAddrStream> {
        let stream = self.open_stream().await?;
        Ok(ClientPacketAddrStream::new(stream, destination))
    }

    /// Number of live pooled sessions.
    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Close every session and reinitialize the pool.
    pub fn reset(&self) {
        let mut sessions = self.sessions.lock();
        for entry in sessions.iter() {
            entry.session.close();
        }
        sessions.clear();
    }

    pub fn close(&self) -> io::Result<()> {
        self.reset();
        Ok(())
    }

    /// Select-or-create a session and open a stream on it, retrying once
    /// against a fresh selection. Only the final error surfaces.
    async fn open_stream(&self) -> io::Result<Box<dyn AsyncStream>> {
        let mut last_error = None;
        for attempt in 0..2 {
            let entry = match self.offer().await {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("session selection failed (attempt {}): {}", attempt, e);
                    last_error = Some(e);
                    continue;
                }
            };
            match entry.session.open().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("stream open failed (attempt {}): {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::other("failed to open multiplexed stream")))
    }

    /// Sweep dead sessions and pick one for the next stream, or create a
    /// new session when the limits call for it.
    async fn offer(&self) -> io::Result<Arc<SessionEntry>> {
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|entry| {
                if entry.session.is_closed() {
                    entry.session.close();
                    false
                } else {
                    true
                }
            });

            if self.brutal.enabled {
                // Brutal pins congestion parameters to one socket; never
                // spread streams over additional sessions.
                if let Some(first) = sessions.first() {
                    return Ok(Arc::clone(first));
                }
            } else {
                let selected = sessions
                    .iter()
                    .filter(|entry| entry.session.can_take_new_request())
                    .min_by_key(|entry| entry.session.num_streams())
                    .cloned();
                if let Some(entry) = selected {
                    let num_streams = entry.session.num_streams();
                    let num_sessions = sessions.len();
                    if num_streams == 0 {
                        return Ok(entry);
                    }
                    if self.max_connections > 0 {
                        if num_sessions >= self.max_connections
                            || num_streams < self.min_streams
                        {
                            return Ok(entry);
                        }
                    } else if self.max_streams > 0 {
                        if num_streams < self.max_streams {
                            return Ok(entry);
                        }
                    } else if num_streams < self.min_streams {
                        return Ok(entry);
                    }
                }
            }
        }
        self.offer_new().await
    }

    /// Dial and stand up a fresh session, then append it to the pool.
    async fn offer_new(&self) -> io::Result<Arc<SessionEntry>> {
        let transport = tokio::time::timeout(
            TCP_TIMEOUT,
            self.dialer.dial(Network::Tcp, &mux_destination()),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "session dial timeout"))??;

        let meta = SessionMeta::from(&transport);
        let session_fd = transport.raw_fd;

        let request = SessionRequest::new(self.protocol, self.padding);
        let stream: Box<dyn AsyncStream> = Box::new(RequestStream::new(transport.stream, request));
        let stream: Box<dyn AsyncStream> = if self.padding {
            Box::new(PaddingStream::new(stream))
        } else {
            stream
        };

        let session = Session::new_client(stream, self.protocol, &meta).await?;

        if self.brutal.enabled {
            if let Err(e) = brutal::client_exchange(&session, session_fd, &self.brutal).await {
                session.close();
                return Err(io::Error::new(
                    e.kind(),
                    format!("brutal exchange: {}", e),
                ));
            }
        }

        debug!("opened new mux session (protocol {:?})", self.protocol);
        let entry = Arc::new(SessionEntry {
            session,
            protocol: self.protocol,
            created_at: Instant::now(),
        });
        self.sessions.lock().push(Arc::clone(&entry));
        Ok(entry)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::server::{EchoHandler, Service, ServiceHandler, ServiceOptions};
    use crate::server_stream::ServerStream;
    use crate::server::ServerPacketConn;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    /// Dialer that connects every session to a fresh in-memory pipe served
    /// by the given service.
    struct ServiceDialer {
        service: Arc<Service>,
        serve_handles: Mutex<Vec<tokio::task::AbortHandle>>,
    }

    impl ServiceDialer {
        fn new(service: Service) -> Arc<Self> {
            Arc::new(Self {
                service: Arc::new(service),
                serve_handles: Mutex::new(Vec::new()),
            })
        }

        /// Tear down every server side, as if the transports died.
        fn kill_all_sessions(&self) {
            for handle in self.serve_handles.lock().iter() {
                handle.abort();
            }
        }
    }

    #[async_trait]
    impl Dialer for ServiceDialer {
        async fn dial(
            &self,
            _network: Network,
            _destination: &NetLocation,
        ) -> io::Result<Transport> {
            let (client_io, server_io) = duplex(512 * 1024);
            let service = Arc::clone(&self.service);
            let handle = tokio::spawn(async move {
                let _ = service
                    .serve(
                        Transport::from_stream(server_io),
                        NetLocation::from_hostname("test.client", 0),
                    )
                    .await;
            })
            .abort_handle();
            self.serve_handles.lock().push(handle);
            Ok(Transport::from_stream(client_io))
        }
    }

    fn echo_service(padding: bool) -> Service {
        Service::new(ServiceOptions {
            handler: Arc::new(EchoHandler),
            padding,
            brutal: BrutalOptions::default(),
        })
        .unwrap()
    }

    fn echo_client(protocol: Protocol, padding: bool) -> Client {
        Client::new(ClientOptions {
            dialer: ServiceDialer::new(echo_service(padding)),
            protocol,
            padding,
            ..Default::default()
        })
    }

    fn dest(port: u16) -> NetLocation {
        NetLocation::new(Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), port)
    }

    /// Handler recording stream destinations and answering "ping" with
    /// "pong".
    struct PingPongHandler {
        destinations: Mutex<Vec<NetLocation>>,
    }

    #[async_trait]
    impl ServiceHandler for PingPongHandler {
        async fn handle_connection(
            &self,
            conn: &mut ServerStream,
            _source: NetLocation,
            destination: NetLocation,
        ) -> io::Result<()> {
            self.destinations.lock().push(destination);
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await?;
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await?;
            conn.flush().await
        }

        async fn handle_packet_connection(
            &self,
            _conn: &mut ServerPacketConn,
            _source: NetLocation,
            _destination: NetLocation,
        ) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tcp_ping_pong_over_smux() {
        let handler = Arc::new(PingPongHandler {
            destinations: Mutex::new(Vec::new()),
        });
        let service = Service::new(ServiceOptions {
            handler: Arc::clone(&handler) as Arc<dyn ServiceHandler>,
            padding: false,
            brutal: BrutalOptions::default(),
        })
        .unwrap();
        let client = Client::new(ClientOptions {
            dialer: ServiceDialer::new(service),
            protocol: Protocol::Smux,
            ..Default::default()
        });

        let mut stream = client.dial_tcp(dest(80)).await.unwrap();
        assert_eq!(stream.remote_addr(), &dest(80));
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(handler.destinations.lock().as_slice(), &[dest(80)]);
    }

    #[tokio::test]
    async fn tcp_echo_with_padding_negotiated() {
        let client = echo_client(Protocol::Smux, true);

        let mut stream = client.dial_tcp(dest(443)).await.unwrap();
        stream.write_all(b"padded payload").await.unwrap();

        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"padded payload");
    }

    #[tokio::test]
    async fn non_padded_connection_rejected() {
        let (mut client_io, server_io) = duplex(4096);
        let service = echo_service(true);
        let serve = tokio::spawn(async move {
            service
                .serve(
                    Transport::from_stream(server_io),
                    NetLocation::from_hostname("test.client", 0),
                )
                .await
        });

        // Version 0 session request: padding cannot be negotiated.
        client_io.write_all(&[0x00, 0x01]).await.unwrap();

        let err = serve.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("non-padded connection rejected"));
    }

    #[tokio::test]
    async fn udp_fixed_destination_echo() {
        let client = echo_client(Protocol::Smux, false);
        let target = NetLocation::new(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53);

        let stream = client.dial_udp(target.clone()).await.unwrap();
        stream.write_packet(b"query").await.unwrap();
        stream.write_packet(b"followup!").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = stream.read_packet_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from, target);
        let n = stream.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"followup!");
    }

    #[tokio::test]
    async fn udp_packet_addr_echo() {
        let client = echo_client(Protocol::Smux, false);
        let target = NetLocation::from_hostname("dns.test", 53);

        let stream = client.listen_packet(dest(0)).await.unwrap();
        stream.write_packet_to(b"hello", &target).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = stream.read_packet_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, target);
    }

    #[tokio::test]
    async fn brutal_refused_by_server_tears_down_session() {
        let client = Client::new(ClientOptions {
            dialer: ServiceDialer::new(echo_service(false)),
            protocol: Protocol::Smux,
            brutal: BrutalOptions {
                enabled: true,
                send_bps: 8_000_000,
                receive_bps: 10_000_000,
            },
            ..Default::default()
        });

        let err = client.dial_tcp(dest(80)).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("brutal is not enabled by the server"),
            "unexpected error: {}",
            err
        );
        assert_eq!(client.num_sessions(), 0);
    }

    #[tokio::test]
    async fn pool_respects_max_streams() {
        let client = Client::new(ClientOptions {
            dialer: ServiceDialer::new(echo_service(false)),
            protocol: Protocol::Smux,
            max_streams: 2,
            ..Default::default()
        });

        let mut streams = Vec::new();
        for _ in 0..4 {
            streams.push(client.dial_tcp(dest(80)).await.unwrap());
        }
        // ceil(4 / 2) sessions, plus at most one in-flight extra.
        let sessions = client.num_sessions();
        assert!((2..=3).contains(&sessions), "got {} sessions", sessions);

        drop(streams);
        client.reset();
        assert_eq!(client.num_sessions(), 0);
    }

    #[tokio::test]
    async fn pool_reuses_session_below_min_streams() {
        let client = Client::new(ClientOptions {
            dialer: ServiceDialer::new(echo_service(false)),
            protocol: Protocol::Smux,
            ..Default::default()
        });

        let mut streams = Vec::new();
        for _ in 0..4 {
            streams.push(client.dial_tcp(dest(80)).await.unwrap());
        }
        // Default limits: one session absorbs the first 8 streams.
        assert_eq!(client.num_sessions(), 1);
        drop(streams);
    }

    #[tokio::test]
    async fn pool_sweeps_dead_sessions() {
        let dialer = ServiceDialer::new(echo_service(false));
        let client = Client::new(ClientOptions {
            dialer: Arc::clone(&dialer) as Arc<dyn Dialer>,
            protocol: Protocol::Smux,
            ..Default::default()
        });

        let stream = client.dial_tcp(dest(80)).await.unwrap();
        assert_eq!(client.num_sessions(), 1);
        drop(stream);

        // Kill the server ends and give the client sessions a moment to
        // observe EOF.
        dialer.kill_all_sessions();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = client.dial_tcp(dest(80)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(client.num_sessions(), 1);
    }

    #[tokio::test]
    async fn tcp_echo_over_h2mux() {
        let client = echo_client(Protocol::H2Mux, false);

        let mut stream = client.dial_tcp(dest(8080)).await.unwrap();
        stream.write_all(b"through h2").await.unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through h2");
    }

    #[tokio::test]
    async fn tcp_echo_over_yamux_with_real_sockets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let service = Arc::new(echo_service(false));
        tokio::spawn(async move {
            loop {
                let Ok((conn, peer)) = listener.accept().await else {
                    break;
                };
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let _ = service
                        .serve(Transport::from_tcp_stream(conn), NetLocation::from(peer))
                        .await;
                });
            }
        });

        struct TcpAddrDialer {
            addr: SocketAddr,
        }

        #[async_trait]
        impl Dialer for TcpAddrDialer {
            async fn dial(
                &self,
                _network: Network,
                _destination: &NetLocation,
            ) -> io::Result<Transport> {
                let stream = tokio::net::TcpStream::connect(self.addr).await?;
                Ok(Transport::from_tcp_stream(stream))
            }
        }

        let client = Client::new(ClientOptions {
            dialer: Arc::new(TcpAddrDialer { addr }),
            protocol: Protocol::Yamux,
            ..Default::default()
        });

        let mut stream = client.dial_tcp(dest(80)).await.unwrap();
        stream.write_all(b"over yamux").await.unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over yamux");
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn service_rejects_brutal_off_linux() {
        let err = Service::new(ServiceOptions {
            handler: Arc::new(EchoHandler),
            padding: false,
            brutal: BrutalOptions {
                enabled: true,
                send_bps: 1_000_000,
                receive_bps: 1_000_000,
            },
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
