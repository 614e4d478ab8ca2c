//! Server-side stream wrappers.
//!
//! The status byte is deferred until the handler's first reply so a
//! handshake failure can still be reported as a structured error status on
//! the wire. UDP variants mirror the client framing and expose front
//! headroom so upstream buffers can be extended in place.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::address::{encode_address, read_address, NetLocation, MAX_SOCKS_ADDR_LEN};
use crate::async_stream::AsyncStream;
use crate::protocol::{put_varint, varint_len, STATUS_ERROR, STATUS_SUCCESS};

fn encode_failure(message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + varint_len(message.len() as u64) + message.len());
    buf.put_u8(STATUS_ERROR);
    put_varint(&mut buf, message.len() as u64);
    buf.put_slice(message.as_bytes());
    buf
}

/// TCP server stream: prepends the success status to the handler's first
/// write, or reports a handshake failure as an error status instead.
pub struct ServerStream {
    inner: Box<dyn AsyncStream>,
    response_written: bool,
    /// Combined status+payload buffer mid-flush: (buffer, payload_len, sent)
    pending: Option<(Bytes, usize, usize)>,
}

impl ServerStream {
    pub fn new(inner: Box<dyn AsyncStream>) -> Self {
        Self {
            inner,
            response_written: false,
            pending: None,
        }
    }

    /// True until the status byte has gone out.
    pub fn need_handshake(&self) -> bool {
        !self.response_written
    }

    pub fn front_headroom(&self) -> usize {
        if self.response_written {
            0
        } else {
            1
        }
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    /// Report a handshake failure to the peer instead of the success
    /// status. Errors if a response already went out.
    pub async fn handshake_failure(&mut self, message: &str) -> io::Result<()> {
        if self.response_written {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream response already written",
            ));
        }
        self.response_written = true;
        let buf = encode_failure(message);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            if let Some((combined, payload_len, mut sent)) = this.pending.take() {
                while sent < combined.len() {
                    match Pin::new(&mut this.inner).poll_write(cx, &combined[sent..]) {
                        Poll::Ready(Ok(n)) => sent += n,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.pending = Some((combined, payload_len, sent));
                            return Poll::Pending;
                        }
                    }
                }
                return Poll::Ready(Ok(payload_len));
            }

            if !this.response_written {
                this.response_written = true;
                let mut combined = BytesMut::with_capacity(1 + buf.len());
                combined.put_u8(STATUS_SUCCESS);
                combined.put_slice(buf);
                this.pending = Some((combined.freeze(), buf.len(), 0));
                continue;
            }

            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.as_mut().get_mut();
        if let Some((combined, payload_len, mut sent)) = this.pending.take() {
            while sent < combined.len() {
                match Pin::new(&mut this.inner).poll_write(cx, &combined[sent..]) {
                    Poll::Ready(Ok(n)) => sent += n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        this.pending = Some((combined, payload_len, sent));
                        return Poll::Pending;
                    }
                }
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Unpin for ServerStream {}

struct PacketWriter {
    half: WriteHalf<Box<dyn AsyncStream>>,
}

impl PacketWriter {
    async fn write_frame(
        &mut self,
        status: bool,
        addr: Option<&NetLocation>,
        payload: &[u8],
    ) -> io::Result<()> {
        if payload.len() > 65535 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet too large",
            ));
        }
        let mut buf = BytesMut::with_capacity(1 + MAX_SOCKS_ADDR_LEN + 2 + payload.len());
        if status {
            buf.put_u8(STATUS_SUCCESS);
        }
        if let Some(addr) = addr {
            encode_address(&mut buf, addr)?;
        }
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        self.half.write_all(&buf).await?;
        self.half.flush().await
    }

    async fn write_failure(&mut self, message: &str) -> io::Result<()> {
        let buf = encode_failure(message);
        self.half.write_all(&buf).await?;
        self.half.flush().await
    }
}

/// UDP server stream with a fixed destination.
pub struct ServerPacketStream {
    reader: Mutex<ReadHalf<Box<dyn AsyncStream>>>,
    writer: Mutex<PacketWriter>,
    response_written: AtomicBool,
    destination: NetLocation,
}

impl ServerPacketStream {
    pub fn new(inner: Box<dyn AsyncStream>, destination: NetLocation) -> Self {
        let (read_half, write_half) = tokio::io::split(inner);
        Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(PacketWriter { half: write_half }),
            response_written: AtomicBool::new(false),
            destination,
        }
    }

    pub fn front_headroom(&self) -> usize {
        let status = if self.response_written.load(Ordering::Relaxed) {
            0
        } else {
            1
        };
        status + 2
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    pub async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        let length = reader.read_u16().await? as usize;
        if buf.len() < length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet buffer too small: {} < {}", buf.len(), length),
            ));
        }
        reader.read_exact(&mut buf[..length]).await?;
        Ok(length)
    }

    pub async fn read_packet_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetLocation)> {
        let n = self.read_packet(buf).await?;
        Ok((n, self.destination.clone()))
    }

    pub async fn write_packet(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let first = !self.response_written.swap(true, Ordering::Relaxed);
        writer.write_frame(first, None, payload).await
    }

    pub async fn handshake_failure(&self, message: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.response_written.swap(true, Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream response already written",
            ));
        }
        writer.write_failure(message).await
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.half.shutdown().await
    }
}

/// UDP server stream in per-packet-address mode.
pub struct ServerPacketAddrStream {
    reader: Mutex<ReadHalf<Box<dyn AsyncStream>>>,
    writer: Mutex<PacketWriter>,
    response_written: AtomicBool,
}

impl ServerPacketAddrStream {
    pub fn new(inner: Box<dyn AsyncStream>) -> Self {
        let (read_half, write_half) = tokio::io::split(inner);
        Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(PacketWriter { half: write_half }),
            response_written: AtomicBool::new(false),
        }
    }

    pub fn front_headroom(&self) -> usize {
        let status = if self.response_written.load(Ordering::Relaxed) {
            0
        } else {
            1
        };
        status + 2 + MAX_SOCKS_ADDR_LEN
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    pub async fn read_packet_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetLocation)> {
        let mut reader = self.reader.lock().await;
        let destination = read_address(&mut *reader).await?;
        let length = reader.read_u16().await? as usize;
        if buf.len() < length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet buffer too small: {} < {}", buf.len(), length),
            ));
        }
        reader.read_exact(&mut buf[..length]).await?;
        Ok((length, destination))
    }

    pub async fn write_packet_to(
        &self,
        payload: &[u8],
        source: &NetLocation,
    ) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let first = !self.response_written.swap(true, Ordering::Relaxed);
        writer.write_frame(first, Some(source), payload).await
    }

    pub async fn handshake_failure(&self, message: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.response_written.swap(true, Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream response already written",
            ));
        }
        writer.write_failure(message).await
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.half.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::protocol::StreamResponse;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    fn dest(port: u16) -> NetLocation {
        NetLocation::new(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn status_prepended_to_first_write() {
        let (server_io, mut client_io) = duplex(4096);
        let mut stream = ServerStream::new(Box::new(server_io));
        assert_eq!(stream.front_headroom(), 1);

        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(stream.front_headroom(), 0);

        let mut wire = [0u8; 5];
        client_io.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], STATUS_SUCCESS);
        assert_eq!(&wire[1..], b"pong");

        // Later writes are raw.
        stream.write_all(b"more").await.unwrap();
        let mut wire = [0u8; 4];
        client_io.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"more");
    }

    #[tokio::test]
    async fn handshake_failure_writes_error_status() {
        let (server_io, mut client_io) = duplex(4096);
        let mut stream = ServerStream::new(Box::new(server_io));

        stream.handshake_failure("connect failed").await.unwrap();

        let response = StreamResponse::read(&mut client_io).await.unwrap();
        assert_eq!(response, StreamResponse::Error("connect failed".to_string()));
    }

    #[tokio::test]
    async fn handshake_failure_after_response_rejected() {
        let (server_io, _client_io) = duplex(4096);
        let mut stream = ServerStream::new(Box::new(server_io));

        stream.write_all(b"data").await.unwrap();
        let err = stream.handshake_failure("too late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn packet_stream_folds_status_into_first_frame() {
        let (server_io, mut client_io) = duplex(4096);
        let stream = ServerPacketStream::new(Box::new(server_io), dest(53));
        assert_eq!(stream.front_headroom(), 3);

        stream.write_packet(b"abc").await.unwrap();
        assert_eq!(stream.front_headroom(), 2);

        let status = client_io.read_u8().await.unwrap();
        assert_eq!(status, STATUS_SUCCESS);
        let len = client_io.read_u16().await.unwrap();
        assert_eq!(len, 3);
        let mut payload = [0u8; 3];
        client_io.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"abc");
    }

    #[tokio::test]
    async fn packet_stream_reads_length_delimited_frames() {
        let (server_io, mut client_io) = duplex(4096);
        let stream = ServerPacketStream::new(Box::new(server_io), dest(53));

        client_io.write_u16(5).await.unwrap();
        client_io.write_all(b"query").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = stream.read_packet_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from, dest(53));
    }

    #[tokio::test]
    async fn packet_addr_stream_frames_and_parses_addresses() {
        let (server_io, mut client_io) = duplex(4096);
        let stream = ServerPacketAddrStream::new(Box::new(server_io));
        assert_eq!(stream.front_headroom(), 1 + 2 + MAX_SOCKS_ADDR_LEN);

        // Inbound frame: address, length, payload.
        let mut frame = BytesMut::new();
        encode_address(&mut frame, &dest(5353)).unwrap();
        frame.put_u16(2);
        frame.put_slice(b"hi");
        client_io.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = stream.read_packet_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, dest(5353));

        // Outbound frame carries status, then address, then length.
        stream.write_packet_to(b"yo", &dest(9999)).await.unwrap();
        let status = client_io.read_u8().await.unwrap();
        assert_eq!(status, STATUS_SUCCESS);
        let addr = read_address(&mut client_io).await.unwrap();
        assert_eq!(addr, dest(9999));
        let len = client_io.read_u16().await.unwrap();
        assert_eq!(len, 2);
    }
}
