//! Session- and stream-level protocol framing.
//!
//! Layout on a fresh connection: one session request (version byte,
//! protocol byte, optional padding flag), then multiplexer traffic. Each
//! logical stream starts with a stream request (network byte, destination
//! address, optional packet-addr flag) from the client and a status byte
//! (plus optional error message) from the server.

use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::{encode_address, read_address, NetLocation};

pub const VERSION_0: u8 = 0;
pub const VERSION_1: u8 = 1;

pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// Standard timeout for dialing and back-end stream open/close.
pub const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pseudo-destination the default dialer connects to for new sessions.
pub fn mux_destination() -> NetLocation {
    NetLocation::from_hostname("sp.mux.sing-box.arpa", 444)
}

/// Back-end multiplexer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    H2Mux = 0,
    Smux = 1,
    Yamux = 2,
}

impl Protocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::H2Mux),
            1 => Some(Self::Smux),
            2 => Some(Self::Yamux),
            _ => None,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "" | "h2mux" => Some(Self::H2Mux),
            "smux" => Some(Self::Smux),
            "yamux" => Some(Self::Yamux),
            _ => None,
        }
    }
}

/// Network kind of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Network {
    Tcp = 0,
    Udp = 1,
}

impl Network {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Tcp),
            1 => Some(Self::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Session request, sent once per underlying connection before any
/// multiplexer bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub version: u8,
    pub protocol: Protocol,
    pub padding: bool,
}

impl SessionRequest {
    pub fn new(protocol: Protocol, padding: bool) -> Self {
        Self {
            version: if padding { VERSION_1 } else { VERSION_0 },
            protocol,
            padding,
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.version >= VERSION_1 {
            3
        } else {
            2
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.protocol as u8);
        if self.version >= VERSION_1 {
            buf.put_u8(self.padding as u8);
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let version = reader.read_u8().await?;
        if version > VERSION_1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported mux version: {}", version),
            ));
        }
        let protocol_byte = reader.read_u8().await?;
        let protocol = Protocol::from_u8(protocol_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported mux protocol: {}", protocol_byte),
            )
        })?;
        let padding = if version >= VERSION_1 {
            reader.read_u8().await? != 0
        } else {
            false
        };
        Ok(Self {
            version,
            protocol,
            padding,
        })
    }
}

/// Stream request, sent once per logical stream before any payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub network: Network,
    pub destination: NetLocation,
    /// UDP only: each packet carries its own destination address.
    pub packet_addr: bool,
}

impl StreamRequest {
    pub fn tcp(destination: NetLocation) -> Self {
        Self {
            network: Network::Tcp,
            destination,
            packet_addr: false,
        }
    }

    pub fn udp(destination: NetLocation, packet_addr: bool) -> Self {
        Self {
            network: Network::Udp,
            destination,
            packet_addr,
        }
    }

    pub fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }

    /// Exact encoded length, used to size the fused first-write buffer.
    pub fn encoded_len(&self) -> usize {
        1 + self.destination.serialized_len() + if self.is_udp() { 1 } else { 0 }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        buf.put_u8(self.network as u8);
        encode_address(buf, &self.destination)?;
        if self.is_udp() {
            buf.put_u8(self.packet_addr as u8);
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let network_byte = reader.read_u8().await?;
        let network = Network::from_u8(network_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown network kind: {}", network_byte),
            )
        })?;
        let destination = read_address(reader).await?;
        let packet_addr = if network == Network::Udp {
            reader.read_u8().await? != 0
        } else {
            false
        };
        Ok(Self {
            network,
            destination,
            packet_addr,
        })
    }
}

/// Stream response, sent once per logical stream before any server bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamResponse {
    Success,
    Error(String),
}

impl StreamResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamResponse::Success)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            StreamResponse::Success => buf.put_u8(STATUS_SUCCESS),
            StreamResponse::Error(message) => {
                buf.put_u8(STATUS_ERROR);
                put_varint(buf, message.len() as u64);
                buf.put_slice(message.as_bytes());
            }
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let status = reader.read_u8().await?;
        match status {
            STATUS_SUCCESS => Ok(StreamResponse::Success),
            STATUS_ERROR => {
                let len = read_varint(reader).await? as usize;
                let mut message = vec![0u8; len];
                reader.read_exact(&mut message).await?;
                Ok(StreamResponse::Error(
                    String::from_utf8_lossy(&message).to_string(),
                ))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid stream response status: {}", status),
            )),
        }
    }
}

/// Append an unsigned LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Encoded length of an unsigned LEB128 varint.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Read an unsigned LEB128 varint, rejecting overlong input.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint too long",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[test]
    fn session_request_v0_layout() {
        let req = SessionRequest::new(Protocol::Smux, false);
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x01]);
        assert_eq!(buf.len(), req.encoded_len());
    }

    #[test]
    fn session_request_v1_layout() {
        let req = SessionRequest::new(Protocol::H2Mux, true);
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn session_request_round_trip() {
        for (protocol, padding) in [
            (Protocol::H2Mux, false),
            (Protocol::Smux, true),
            (Protocol::Yamux, false),
        ] {
            let req = SessionRequest::new(protocol, padding);
            let mut buf = BytesMut::new();
            req.encode(&mut buf);
            let mut cursor = Cursor::new(buf.to_vec());
            let decoded = SessionRequest::read(&mut cursor).await.unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[tokio::test]
    async fn session_request_rejects_unknown_protocol() {
        let mut cursor = Cursor::new(vec![0x00, 0x09]);
        let err = SessionRequest::read(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn stream_request_tcp_layout() {
        let req = StreamRequest::tcp(NetLocation::new(
            Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)),
            80,
        ));
        let mut buf = BytesMut::new();
        req.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]);
        assert_eq!(buf.len(), req.encoded_len());

        let mut cursor = Cursor::new(buf.to_vec());
        let decoded = StreamRequest::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn stream_request_udp_round_trip() {
        for packet_addr in [false, true] {
            let req = StreamRequest::udp(NetLocation::from_hostname("dns.local", 53), packet_addr);
            let mut buf = BytesMut::new();
            req.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), req.encoded_len());
            let mut cursor = Cursor::new(buf.to_vec());
            let decoded = StreamRequest::read(&mut cursor).await.unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[tokio::test]
    async fn stream_request_rejects_unknown_network() {
        let mut cursor = Cursor::new(vec![0x07]);
        let err = StreamRequest::read(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn stream_response_success_is_one_byte() {
        let mut buf = BytesMut::new();
        StreamResponse::Success.encode(&mut buf);
        assert_eq!(&buf[..], &[STATUS_SUCCESS]);

        let mut cursor = Cursor::new(buf.to_vec());
        let decoded = StreamResponse::read(&mut cursor).await.unwrap();
        assert!(decoded.is_success());
    }

    #[tokio::test]
    async fn stream_response_error_round_trip() {
        let resp = StreamResponse::Error("connection refused".to_string());
        let mut buf = BytesMut::new();
        resp.encode(&mut buf);
        assert_eq!(buf[0], STATUS_ERROR);
        assert_eq!(buf[1], 18);

        let mut cursor = Cursor::new(buf.to_vec());
        let decoded = StreamResponse::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            let mut cursor = Cursor::new(buf.to_vec());
            assert_eq!(read_varint(&mut cursor).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn varint_rejects_overlong() {
        let mut cursor = Cursor::new(vec![0x80u8; 11]);
        let err = read_varint(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
