//! TCP Brutal bandwidth exchange and kernel congestion-control coupling.
//!
//! After a new session opens, client and server trade receive rates over a
//! meta-stream addressed to the reserved FQDN, then each side applies
//! `min(own send rate, peer receive rate)` to the underlying session
//! socket via the `brutal` congestion-control module. Requires the
//! tcp-brutal kernel module; on non-Linux hosts the socket coupling fails
//! with a clear error and Brutal must stay disabled.

use std::io;

use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::NetLocation;
use crate::protocol::{put_varint, read_varint, varint_len};

/// Reserved pseudo-destination for the exchange; never forwarded to user
/// handlers.
pub const BRUTAL_EXCHANGE_DOMAIN: &str = "_BrutalBwExchange";

/// Rates below this indicate a configuration bug. Documented floor only;
/// the exchange does not enforce it.
pub const BRUTAL_MIN_SPEED_BPS: u64 = 65536;

/// Whether the kernel coupling can work on this host at all.
pub const BRUTAL_AVAILABLE: bool = cfg!(target_os = "linux");

/// Bandwidth-exchange configuration shared by client and server.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrutalOptions {
    pub enabled: bool,
    /// Bytes per second this side is willing to send.
    pub send_bps: u64,
    /// Bytes per second this side can receive.
    pub receive_bps: u64,
}

/// Does `destination` name the Brutal meta-stream?
pub fn is_brutal_exchange(network_is_tcp: bool, destination: &NetLocation) -> bool {
    network_is_tcp && destination.hostname() == Some(BRUTAL_EXCHANGE_DOMAIN)
}

pub async fn write_brutal_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    receive_bps: u64,
) -> io::Result<()> {
    writer.write_u64(receive_bps).await?;
    writer.flush().await
}

pub async fn read_brutal_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    reader.read_u64().await
}

pub async fn write_brutal_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    receive_bps: u64,
    ok: bool,
    message: &str,
) -> io::Result<()> {
    let mut buf = if ok {
        let mut buf = BytesMut::with_capacity(1 + 8);
        buf.put_u8(1);
        buf.put_u64(receive_bps);
        buf
    } else {
        let mut buf = BytesMut::with_capacity(1 + varint_len(message.len() as u64) + message.len());
        buf.put_u8(0);
        put_varint(&mut buf, message.len() as u64);
        buf.put_slice(message.as_bytes());
        buf
    };
    writer.write_all_buf(&mut buf).await?;
    writer.flush().await
}

/// Read the server's response; a refusal surfaces as a remote error.
pub async fn read_brutal_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let ok = reader.read_u8().await? != 0;
    if ok {
        reader.read_u64().await
    } else {
        let len = read_varint(reader).await? as usize;
        let mut message = vec![0u8; len];
        reader.read_exact(&mut message).await?;
        Err(io::Error::other(format!(
            "remote error: {}",
            String::from_utf8_lossy(&message)
        )))
    }
}

/// Apply the `brutal` congestion control and its rate parameters to the
/// session socket.
#[cfg(target_os = "linux")]
pub fn set_brutal_options(fd: i32, send_bps: u64) -> io::Result<()> {
    const TCP_BRUTAL_PARAMS: libc::c_int = 23301;

    #[repr(C, packed)]
    struct TcpBrutalParams {
        rate: u64,
        cwnd_gain: u32,
    }

    let congestion = b"brutal";
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            congestion.as_ptr() as *const libc::c_void,
            congestion.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(
            err.kind(),
            format!(
                "setsockopt TCP_CONGESTION brutal: {} (is the tcp-brutal kernel module installed?)",
                err
            ),
        ));
    }

    let params = TcpBrutalParams {
        rate: send_bps,
        cwnd_gain: 20,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            TCP_BRUTAL_PARAMS,
            &params as *const TcpBrutalParams as *const libc::c_void,
            std::mem::size_of::<TcpBrutalParams>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(
            err.kind(),
            format!("setsockopt TCP_BRUTAL_PARAMS: {}", err),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_brutal_options(_fd: i32, _send_bps: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP Brutal is only supported on Linux",
    ))
}

/// Client side of the exchange, run once per new session. Exchange
/// failures propagate (the caller tears the session down); failure to
/// apply the socket options is logged at debug and otherwise ignored.
pub(crate) async fn client_exchange(
    session: &crate::session::Session,
    session_fd: Option<i32>,
    options: &BrutalOptions,
) -> io::Result<()> {
    let stream = session.open().await?;
    let destination = NetLocation::from_hostname(BRUTAL_EXCHANGE_DOMAIN, 0);
    let mut conn = crate::client_stream::ClientStream::new(stream, destination);

    write_brutal_request(&mut conn, options.receive_bps).await?;
    let server_receive_bps = read_brutal_response(&mut conn).await?;
    let _ = conn.shutdown().await;

    let send_bps = options.send_bps.min(server_receive_bps);
    let apply_result = match session_fd {
        Some(fd) => set_brutal_options(fd, send_bps),
        None => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "session transport has no socket fd",
        )),
    };
    if let Err(e) = apply_result {
        debug!("failed to enable TCP Brutal at client: {}", e);
    }
    Ok(())
}

/// Server side of the exchange, invoked when a stream requests the
/// reserved FQDN. Writes a structured refusal when Brutal is disabled or
/// the socket options cannot be applied.
pub(crate) async fn server_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    session_fd: Option<i32>,
    options: &BrutalOptions,
) -> io::Result<()> {
    let client_receive_bps = read_brutal_request(conn).await?;

    if !options.enabled {
        return write_brutal_response(conn, 0, false, "brutal is not enabled by the server").await;
    }

    let send_bps = options.send_bps.min(client_receive_bps);
    let apply_result = match session_fd {
        Some(fd) => set_brutal_options(fd, send_bps),
        None => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "session transport has no socket fd",
        )),
    };
    if let Err(e) = apply_result {
        return write_brutal_response(conn, 0, false, &format!("enable TCP Brutal: {}", e)).await;
    }

    write_brutal_response(conn, options.receive_bps, true, "").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_round_trip() {
        let mut wire = Cursor::new(Vec::new());
        write_brutal_request(&mut wire, 10_000_000).await.unwrap();
        let wire = wire.into_inner();
        assert_eq!(wire.len(), 8);
        assert_eq!(wire, 10_000_000u64.to_be_bytes());

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_brutal_request(&mut cursor).await.unwrap(), 10_000_000);
    }

    #[tokio::test]
    async fn response_success_round_trip() {
        let mut wire = Cursor::new(Vec::new());
        write_brutal_response(&mut wire, 5_000_000, true, "")
            .await
            .unwrap();
        let wire = wire.into_inner();
        assert_eq!(wire[0], 1);
        assert_eq!(wire.len(), 9);

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_brutal_response(&mut cursor).await.unwrap(), 5_000_000);
    }

    #[tokio::test]
    async fn response_refusal_surfaces_remote_error() {
        let mut wire = Cursor::new(Vec::new());
        write_brutal_response(&mut wire, 0, false, "brutal is not enabled by the server")
            .await
            .unwrap();
        let wire = wire.into_inner();
        assert_eq!(wire[0], 0);

        let mut cursor = Cursor::new(wire);
        let err = read_brutal_response(&mut cursor).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote error: brutal is not enabled by the server"
        );
    }

    #[test]
    fn exchange_domain_matcher() {
        let brutal = NetLocation::from_hostname(BRUTAL_EXCHANGE_DOMAIN, 0);
        assert!(is_brutal_exchange(true, &brutal));
        assert!(!is_brutal_exchange(false, &brutal));
        let normal = NetLocation::from_hostname("example.com", 443);
        assert!(!is_brutal_exchange(true, &normal));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn set_brutal_options_unsupported_off_linux() {
        let err = set_brutal_options(0, BRUTAL_MIN_SPEED_BPS).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
