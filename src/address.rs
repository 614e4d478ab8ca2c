//! Destination address model and SOCKS-style serialization.
//!
//! Addresses travel on the wire as: address-type byte (0x01 IPv4, 0x03
//! hostname, 0x04 IPv6), raw address bytes, then a 2-byte big-endian port.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_HOSTNAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

/// Worst-case serialized address length: type byte + length byte + 255
/// hostname bytes + 2-byte port.
pub const MAX_SOCKS_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// A destination address: IP literal or hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => ip.fmt(f),
            Address::Ipv6(ip) => ip.fmt(f),
            Address::Hostname(host) => host.fmt(f),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::Ipv4(ip),
            IpAddr::V6(ip) => Address::Ipv6(ip),
        }
    }
}

/// A destination address plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_hostname(host: impl Into<String>, port: u16) -> Self {
        Self {
            address: Address::Hostname(host.into()),
            port,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hostname if this is an FQDN destination.
    pub fn hostname(&self) -> Option<&str> {
        match &self.address {
            Address::Hostname(host) => Some(host.as_str()),
            _ => None,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match &self.address {
            Address::Ipv4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Address::Ipv6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Address::Hostname(_) => None,
        }
    }

    /// Serialized length of this address in SOCKS form.
    pub fn serialized_len(&self) -> usize {
        let addr_len = match &self.address {
            Address::Ipv4(_) => 4,
            Address::Ipv6(_) => 16,
            Address::Hostname(host) => 1 + host.len(),
        };
        1 + addr_len + 2
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}

impl From<SocketAddr> for NetLocation {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().into(), addr.port())
    }
}

/// Encode a location into `buf` in SOCKS address form.
/// Hostnames longer than 255 bytes cannot be represented.
pub fn encode_address(buf: &mut BytesMut, location: &NetLocation) -> io::Result<()> {
    match location.address() {
        Address::Ipv4(ip) => {
            buf.put_u8(ADDR_TYPE_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::Ipv6(ip) => {
            buf.put_u8(ADDR_TYPE_IPV6);
            buf.put_slice(&ip.octets());
        }
        Address::Hostname(host) => {
            let host_bytes = host.as_bytes();
            if host_bytes.len() > 255 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("hostname too long: {} bytes (max 255)", host_bytes.len()),
                ));
            }
            buf.put_u8(ADDR_TYPE_HOSTNAME);
            buf.put_u8(host_bytes.len() as u8);
            buf.put_slice(host_bytes);
        }
    }
    buf.put_u16(location.port());
    Ok(())
}

/// Decode a SOCKS address from a byte slice, advancing it.
pub fn decode_address(data: &mut &[u8]) -> io::Result<NetLocation> {
    if data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "address too short",
        ));
    }
    let addr_type = data.get_u8();
    let address = match addr_type {
        ADDR_TYPE_IPV4 => {
            if data.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "IPv4 address too short",
                ));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&data[..4]);
            data.advance(4);
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_TYPE_HOSTNAME => {
            if data.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "hostname length missing",
                ));
            }
            let len = data.get_u8() as usize;
            if data.len() < len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "hostname too short",
                ));
            }
            let host = String::from_utf8_lossy(&data[..len]).to_string();
            data.advance(len);
            Address::Hostname(host)
        }
        ADDR_TYPE_IPV6 => {
            if data.len() < 16 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "IPv6 address too short",
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            data.advance(16);
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type: {}", addr_type),
            ));
        }
    };
    if data.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "port missing"));
    }
    let port = data.get_u16();
    Ok(NetLocation::new(address, port))
}

/// Decode a SOCKS address from an async reader.
pub async fn read_address<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<NetLocation> {
    let addr_type = reader.read_u8().await?;
    let address = match addr_type {
        ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_TYPE_HOSTNAME => {
            let len = reader.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            reader.read_exact(&mut host).await?;
            Address::Hostname(String::from_utf8_lossy(&host).to_string())
        }
        ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type: {}", addr_type),
            ));
        }
    };
    let port = reader.read_u16().await?;
    Ok(NetLocation::new(address, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_ipv4() {
        let loc = NetLocation::new(Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 80);
        let mut buf = BytesMut::new();
        encode_address(&mut buf, &loc).unwrap();
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x00, 0x50]);

        let mut slice = &buf[..];
        let decoded = decode_address(&mut slice).unwrap();
        assert_eq!(decoded, loc);
        assert!(slice.is_empty());
    }

    #[test]
    fn encode_decode_hostname() {
        let loc = NetLocation::from_hostname("example.com", 443);
        let mut buf = BytesMut::new();
        encode_address(&mut buf, &loc).unwrap();
        assert_eq!(buf[0], ADDR_TYPE_HOSTNAME);
        assert_eq!(buf[1], 11);
        assert_eq!(buf.len(), loc.serialized_len());

        let mut slice = &buf[..];
        let decoded = decode_address(&mut slice).unwrap();
        assert_eq!(decoded, loc);
    }

    #[test]
    fn encode_decode_ipv6() {
        let loc = NetLocation::new(Address::Ipv6(Ipv6Addr::LOCALHOST), 8080);
        let mut buf = BytesMut::new();
        encode_address(&mut buf, &loc).unwrap();
        assert_eq!(buf.len(), 1 + 16 + 2);

        let mut slice = &buf[..];
        let decoded = decode_address(&mut slice).unwrap();
        assert_eq!(decoded, loc);
    }

    #[test]
    fn hostname_too_long_rejected() {
        let loc = NetLocation::from_hostname("a".repeat(256), 443);
        let mut buf = BytesMut::new();
        let err = encode_address(&mut buf, &loc).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn async_decode_matches_sync() {
        let loc = NetLocation::from_hostname("test.host", 53);
        let mut buf = BytesMut::new();
        encode_address(&mut buf, &loc).unwrap();

        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let decoded = read_address(&mut cursor).await.unwrap();
        assert_eq!(decoded, loc);
    }

    #[test]
    fn unknown_address_type() {
        let data = [0x07u8, 0, 0];
        let mut slice = &data[..];
        let err = decode_address(&mut slice).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn max_len_covers_worst_case() {
        let loc = NetLocation::from_hostname("h".repeat(255), 65535);
        assert_eq!(loc.serialized_len(), MAX_SOCKS_ADDR_LEN);
    }

    #[test]
    fn display_formats() {
        let v4 = NetLocation::new(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 53);
        assert_eq!(v4.to_string(), "10.0.0.1:53");
        let v6 = NetLocation::new(Address::Ipv6(Ipv6Addr::LOCALHOST), 80);
        assert_eq!(v6.to_string(), "[::1]:80");
        let host = NetLocation::from_hostname("example.com", 443);
        assert_eq!(host.to_string(), "example.com:443");
    }
}
