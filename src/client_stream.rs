//! Client-side stream wrappers with the lazy handshake pattern.
//!
//! The first write on a stream fuses the stream request with the payload
//! into a single underlying write; the first read consumes the server's
//! stream response and converts an error status into a `remote error`.
//! UDP wrappers frame packets with a 2-byte big-endian length, optionally
//! preceded by a per-packet destination address.

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::address::{read_address, NetLocation, MAX_SOCKS_ADDR_LEN};
use crate::async_stream::AsyncStream;
use crate::protocol::{StreamRequest, StreamResponse, STATUS_ERROR, STATUS_SUCCESS};

/// Incremental parser for the stream response consumed on first read.
#[derive(Debug)]
enum ResponseState {
    Status,
    ErrorLen { shift: u32, len: u64 },
    ErrorMsg { msg: Vec<u8>, filled: usize },
    Established,
    Failed(String),
}

fn remote_error(message: &str) -> io::Error {
    io::Error::other(format!("remote error: {}", message))
}

/// TCP stream wrapper: request on first write, response on first read,
/// passthrough afterwards.
#[derive(Debug)]
pub struct ClientStream {
    inner: Box<dyn AsyncStream>,
    destination: NetLocation,
    /// Stream request awaiting the first write; None once sent.
    request: Option<StreamRequest>,
    /// Unsent portion of the encoded request (vectored partial writes).
    request_bytes: Option<Bytes>,
    /// Combined request+payload buffer mid-flush: (buffer, payload_len, sent)
    pending: Option<(Bytes, usize, usize)>,
    response: ResponseState,
}

impl ClientStream {
    pub fn new(inner: Box<dyn AsyncStream>, destination: NetLocation) -> Self {
        Self {
            inner,
            request: Some(StreamRequest::tcp(destination.clone())),
            request_bytes: None,
            pending: None,
            destination,
            response: ResponseState::Status,
        }
    }

    /// True until the stream request has gone out.
    pub fn need_handshake(&self) -> bool {
        self.request.is_some() || self.request_bytes.is_some()
    }

    /// The logical destination, not the shared underlying peer.
    pub fn remote_addr(&self) -> &NetLocation {
        &self.destination
    }

    /// Callers should layer a user-space read deadline on top of kernel
    /// deadlines, which do not reach the multiplexed stream.
    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    fn take_request_bytes(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(bytes) = self.request_bytes.take() {
            return Ok(Some(bytes));
        }
        if let Some(request) = self.request.take() {
            let mut buf = BytesMut::with_capacity(request.encoded_len());
            request.encode(&mut buf)?;
            return Ok(Some(buf.freeze()));
        }
        Ok(None)
    }

    /// Drive the response parser one step. Ready(Ok) means established.
    fn poll_read_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match &mut self.response {
                ResponseState::Established => return Poll::Ready(Ok(())),
                ResponseState::Failed(message) => {
                    return Poll::Ready(Err(remote_error(message)));
                }
                ResponseState::Status => {
                    let mut byte = [0u8; 1];
                    let mut temp_buf = ReadBuf::new(&mut byte);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp_buf) {
                        Poll::Ready(Ok(())) => {
                            if temp_buf.filled().is_empty() {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "EOF while reading stream response",
                                )));
                            }
                            match byte[0] {
                                STATUS_SUCCESS => self.response = ResponseState::Established,
                                STATUS_ERROR => {
                                    self.response = ResponseState::ErrorLen { shift: 0, len: 0 }
                                }
                                status => {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        format!("invalid stream response status: {}", status),
                                    )));
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ResponseState::ErrorLen { shift, len } => {
                    let mut byte = [0u8; 1];
                    let mut temp_buf = ReadBuf::new(&mut byte);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp_buf) {
                        Poll::Ready(Ok(())) => {
                            if temp_buf.filled().is_empty() {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "EOF while reading error message length",
                                )));
                            }
                            *len |= ((byte[0] & 0x7F) as u64) << *shift;
                            if byte[0] & 0x80 == 0 {
                                let len = *len as usize;
                                self.response = ResponseState::ErrorMsg {
                                    msg: vec![0u8; len],
                                    filled: 0,
                                };
                            } else {
                                *shift += 7;
                                if *shift >= 64 {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "varint too long",
                                    )));
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ResponseState::ErrorMsg { msg, filled } => {
                    if *filled == msg.len() {
                        let message = String::from_utf8_lossy(msg).to_string();
                        let err = remote_error(&message);
                        self.response = ResponseState::Failed(message);
                        return Poll::Ready(Err(err));
                    }
                    let mut temp_buf = ReadBuf::new(&mut msg[*filled..]);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = temp_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "EOF while reading error message",
                                )));
                            }
                            *filled += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.as_mut().get_mut();
        if !matches!(this.response, ResponseState::Established) {
            match this.poll_read_response(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClientStream {
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

            let request_bytes = match this.take_request_bytes() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Pin::new(&mut this.inner).poll_write(cx, buf),
                Err(e) => return Poll::Ready(Err(e)),
            };

            if this.inner.is_write_vectored() {
                let slices = [IoSlice::new(&request_bytes), IoSlice::new(buf)];
                match Pin::new(&mut this.inner).poll_write_vectored(cx, &slices) {
                    Poll::Ready(Ok(n)) => {
                        if n >= request_bytes.len() {
                            let payload_written = n - request_bytes.len();
                            if payload_written > 0 {
                                return Poll::Ready(Ok(payload_written));
                            }
                            continue;
                        }
                        this.request_bytes = Some(request_bytes.slice(n..));
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        this.request_bytes = Some(request_bytes);
                        return Poll::Pending;
                    }
                }
            }

            let mut combined = BytesMut::with_capacity(request_bytes.len() + buf.len());
            combined.extend_from_slice(&request_bytes);
            combined.extend_from_slice(buf);
            this.pending = Some((combined.freeze(), buf.len(), 0));
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

impl Unpin for ClientStream {}

/// Allocation preferences registered for the read-waiter API.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferAllocOptions {
    /// Bytes reserved (zero-filled) in front of the payload so headers can
    /// be prepended in place.
    pub front_headroom: usize,
}

/// A packet buffer allocated to exact size by the read waiter; the payload
/// begins at `offset`.
#[derive(Debug)]
pub struct PacketBuffer {
    pub data: BytesMut,
    pub offset: usize,
}

impl PacketBuffer {
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

struct PacketReader {
    half: ReadHalf<Box<dyn AsyncStream>>,
    response_read: bool,
    alloc: BufferAllocOptions,
}

impl PacketReader {
    async fn ensure_response(&mut self) -> io::Result<()> {
        if self.response_read {
            return Ok(());
        }
        match StreamResponse::read(&mut self.half).await? {
            StreamResponse::Success => {
                self.response_read = true;
                Ok(())
            }
            StreamResponse::Error(message) => Err(remote_error(&message)),
        }
    }

    async fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length = self.half.read_u16().await? as usize;
        if buf.len() < length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet buffer too small: {} < {}", buf.len(), length),
            ));
        }
        self.half.read_exact(&mut buf[..length]).await?;
        Ok(length)
    }

    async fn wait_read_frame(&mut self) -> io::Result<PacketBuffer> {
        let length = self.half.read_u16().await? as usize;
        let offset = self.alloc.front_headroom;
        let mut data = BytesMut::with_capacity(offset + length);
        data.resize(offset + length, 0);
        self.half.read_exact(&mut data[offset..]).await?;
        Ok(PacketBuffer { data, offset })
    }
}

struct PacketWriter {
    half: WriteHalf<Box<dyn AsyncStream>>,
    request_written: bool,
}

impl PacketWriter {
    /// Emit the stream request fused with the first packet frame.
    async fn write_request(
        &mut self,
        request: &StreamRequest,
        frame: impl FnOnce(&mut BytesMut) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(request.encoded_len() + 2);
        request.encode(&mut buf)?;
        frame(&mut buf)?;
        self.half.write_all(&buf).await?;
        self.half.flush().await?;
        self.request_written = true;
        Ok(())
    }

    async fn write_frame(&mut self, payload: &[u8], addr: Option<&NetLocation>) -> io::Result<()> {
        if payload.len() > 65535 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet too large",
            ));
        }
        let mut buf =
            BytesMut::with_capacity(MAX_SOCKS_ADDR_LEN + 2 + payload.len());
        if let Some(addr) = addr {
            crate::address::encode_address(&mut buf, addr)?;
        }
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        self.half.write_all(&buf).await?;
        self.half.flush().await
    }
}

/// UDP stream wrapper with a fixed destination: every packet is a 2-byte
/// length-delimited frame. Reads and writes lock independent halves, so
/// concurrent use is safe; the write lock serializes the first-write race.
pub struct ClientPacketStream {
    reader: Mutex<PacketReader>,
    writer: Mutex<PacketWriter>,
    destination: NetLocation,
}

impl ClientPacketStream {
    pub fn new(inner: Box<dyn AsyncStream>, destination: NetLocation) -> Self {
        let (read_half, write_half) = tokio::io::split(inner);
        Self {
            reader: Mutex::new(PacketReader {
                half: read_half,
                response_read: false,
                alloc: BufferAllocOptions::default(),
            }),
            writer: Mutex::new(PacketWriter {
                half: write_half,
                request_written: false,
            }),
            destination,
        }
    }

    pub fn remote_addr(&self) -> &NetLocation {
        &self.destination
    }

    pub fn front_headroom(&self) -> usize {
        2
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    pub async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.ensure_response().await?;
        reader.read_frame(buf).await
    }

    /// Read a packet and report its source, which for the fixed-destination
    /// wrapper is always the configured destination.
    pub async fn read_packet_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetLocation)> {
        let n = self.read_packet(buf).await?;
        Ok((n, self.destination.clone()))
    }

    pub async fn write_packet(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if !writer.request_written {
            let request = StreamRequest::udp(self.destination.clone(), false);
            return writer
                .write_request(&request, |buf| {
                    if !payload.is_empty() {
                        if payload.len() > 65535 {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "packet too large",
                            ));
                        }
                        buf.put_u16(payload.len() as u16);
                        buf.put_slice(payload);
                    }
                    Ok(())
                })
                .await;
        }
        writer.write_frame(payload, None).await
    }

    /// Register allocation preferences for `wait_read_packet`.
    pub async fn register_read_buffer(&self, options: BufferAllocOptions) {
        self.reader.lock().await.alloc = options;
    }

    /// Read the frame header, then allocate exactly the needed buffer and
    /// fill it, avoiding a size-unknown copy.
    pub async fn wait_read_packet(&self) -> io::Result<(PacketBuffer, NetLocation)> {
        let mut reader = self.reader.lock().await;
        reader.ensure_response().await?;
        let buffer = reader.wait_read_frame().await?;
        Ok((buffer, self.destination.clone()))
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.half.shutdown().await
    }
}

/// UDP stream wrapper in per-packet-address mode: every frame carries a
/// destination address before the 2-byte length.
pub struct ClientPacketAddrStream {
    reader: Mutex<PacketReader>,
    writer: Mutex<PacketWriter>,
    destination: NetLocation,
}

impl ClientPacketAddrStream {
    pub fn new(inner: Box<dyn AsyncStream>, destination: NetLocation) -> Self {
        let (read_half, write_half) = tokio::io::split(inner);
        Self {
            reader: Mutex::new(PacketReader {
                half: read_half,
                response_read: false,
                alloc: BufferAllocOptions::default(),
            }),
            writer: Mutex::new(PacketWriter {
                half: write_half,
                request_written: false,
            }),
            destination,
        }
    }

    pub fn front_headroom(&self) -> usize {
        2 + MAX_SOCKS_ADDR_LEN
    }

    pub fn need_additional_read_deadline(&self) -> bool {
        true
    }

    pub async fn read_packet_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetLocation)> {
        let mut reader = self.reader.lock().await;
        reader.ensure_response().await?;
        let source = read_address(&mut reader.half).await?;
        let n = reader.read_frame(buf).await?;
        Ok((n, source))
    }

    pub async fn write_packet_to(
        &self,
        payload: &[u8],
        destination: &NetLocation,
    ) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if !writer.request_written {
            let request = StreamRequest::udp(self.destination.clone(), true);
            return writer
                .write_request(&request, |buf| {
                    if !payload.is_empty() {
                        if payload.len() > 65535 {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "packet too large",
                            ));
                        }
                        crate::address::encode_address(buf, destination)?;
                        buf.put_u16(payload.len() as u16);
                        buf.put_slice(payload);
                    }
                    Ok(())
                })
                .await;
        }
        writer.write_frame(payload, Some(destination)).await
    }

    pub async fn register_read_buffer(&self, options: BufferAllocOptions) {
        self.reader.lock().await.alloc = options;
    }

    pub async fn wait_read_packet(&self) -> io::Result<(PacketBuffer, NetLocation)> {
        let mut reader = self.reader.lock().await;
        reader.ensure_response().await?;
        let source = read_address(&mut reader.half).await?;
        let buffer = reader.wait_read_frame().await?;
        Ok((buffer, source))
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.half.shutdown().await
    }
}
