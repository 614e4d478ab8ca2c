//! braid - stream multiplexing for proxy transports
//!
//! Packs many logical TCP- and UDP-like streams over a small pool of
//! underlying connections and demultiplexes them on the server side.
//!
//! Three layers sit on each underlying connection:
//! 1. Session layer: version negotiation and optional padding
//! 2. Multiplexer layer: H2-CONNECT, smux, or yamux framing
//! 3. Stream layer: per-stream destination addressing and status
//!
//! Optional extras: a padding envelope over the first frames in each
//! direction, and a TCP Brutal bandwidth exchange that configures
//! kernel-side congestion control on the session socket.
//!
//! ## Client
//! ```ignore
//! let client = Client::new(ClientOptions { protocol: Protocol::Smux, ..Default::default() });
//! let stream = client.dial_tcp(NetLocation::from_hostname("example.com", 443)).await?;
//! ```
//!
//! ## Server
//! ```ignore
//! let service = Service::new(ServiceOptions { handler, padding: false, brutal: Default::default() })?;
//! service.serve(Transport::from_tcp_stream(conn), source).await?;
//! ```

pub mod address;
pub mod async_stream;
pub mod brutal;
pub mod client;
pub mod client_stream;
mod h2_client;
mod h2_server;
pub mod padding;
pub mod protocol;
pub mod request_stream;
pub mod server;
pub mod server_stream;
pub mod session;
mod smux;
mod yamux;

pub use address::{Address, NetLocation, MAX_SOCKS_ADDR_LEN};
pub use async_stream::{AsyncStream, Dialer, TcpDialer, Transport};
pub use brutal::{BrutalOptions, BRUTAL_AVAILABLE, BRUTAL_EXCHANGE_DOMAIN, BRUTAL_MIN_SPEED_BPS};
pub use client::{Client, ClientConn, ClientOptions};
pub use client_stream::{
    BufferAllocOptions, ClientPacketAddrStream, ClientPacketStream, ClientStream, PacketBuffer,
};
pub use protocol::{Network, Protocol, SessionRequest, StreamRequest, StreamResponse};
pub use request_stream::RequestStream;
pub use server::{Service, ServiceHandler, ServiceOptions, ServerPacketConn};
pub use server_stream::{ServerPacketAddrStream, ServerPacketStream, ServerStream};
pub use session::{Session, SessionMeta};
