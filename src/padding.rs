//! Padding layer applied between the session request and the multiplexer.
//!
//! The first 900 frames in each direction (counted independently) carry a
//! padding envelope; afterwards the wrapper is a transparent passthrough.
//!
//! Frame format during the padded phase:
//! ```text
//! +------------------+-----------------+-------------+---------------+
//! | Payload Length   | Padding Length  | Payload     | Padding       |
//! | (2 bytes BE)     | (1 byte)        | (variable)  | (0-255 bytes) |
//! +------------------+-----------------+-------------+---------------+
//! ```
//!
//! Both peers must negotiate padding in the session request; enabling it
//! unilaterally desynchronizes the connection.

use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const FIRST_PADDINGS: usize = 900;
const HEADER_SIZE: usize = 3;
const MAX_PADDING: u8 = 255;
const MAX_PAYLOAD_SIZE: usize = 65535;
const SKIP_BUF_SIZE: usize = 256;

/// Read state machine for the padded phase.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 3-byte frame header
    Header { pos: usize },
    /// Delivering frame payload to the caller
    Data {
        remaining: usize,
        padding_after: usize,
    },
    /// Discarding padding bytes after the payload
    SkipPadding { remaining: usize },
    /// Padded phase complete
    Passthrough,
}

/// Write state machine for the padded phase.
#[derive(Debug, Clone, Copy)]
enum WriteState {
    /// Ready to accept a new write
    Ready,
    /// Frame built, inner write returned Pending, flush then report Ok
    Pending { pos: usize, payload_len: usize },
    /// Frame partially written and already reported Ok, flush before next
    Partial { pos: usize },
    /// Padded phase complete
    Passthrough,
}

/// Stream wrapper that envelopes the first 900 frames in each direction.
pub struct PaddingStream<S> {
    inner: S,
    read_state: ReadState,
    read_count: usize,
    read_header: [u8; HEADER_SIZE],
    skip_buf: [u8; SKIP_BUF_SIZE],
    write_state: WriteState,
    write_count: usize,
    write_buffer: BytesMut,
}

impl<S> PaddingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_state: ReadState::Header { pos: 0 },
            read_count: 0,
            read_header: [0u8; HEADER_SIZE],
            skip_buf: [0u8; SKIP_BUF_SIZE],
            write_state: WriteState::Ready,
            write_count: 0,
            write_buffer: BytesMut::new(),
        }
    }

    /// Transitions write state after the frame buffer is fully flushed.
    fn finish_write_flush(&mut self) {
        self.write_buffer.clear();
        self.write_count += 1;
        if self.write_count >= FIRST_PADDINGS {
            let _ = mem::take(&mut self.write_buffer);
            self.write_state = WriteState::Passthrough;
        } else {
            self.write_state = WriteState::Ready;
        }
    }
}

impl<S: Unpin> Unpin for PaddingStream<S> {}

impl<S: AsyncRead + Unpin> AsyncRead for PaddingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.read_state {
                ReadState::Passthrough => {
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }

                ReadState::Header { mut pos } => {
                    while pos < HEADER_SIZE {
                        let mut temp_buf = ReadBuf::new(&mut this.read_header[pos..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut temp_buf) {
                            Poll::Ready(Ok(())) => {
                                let n = temp_buf.filled().len();
                                if n == 0 {
                                    if pos == 0 {
                                        return Poll::Ready(Ok(()));
                                    }
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        "EOF while reading padding frame header",
                                    )));
                                }
                                pos += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.read_state = ReadState::Header { pos };
                                return Poll::Pending;
                            }
                        }
                    }

                    let payload_len =
                        u16::from_be_bytes([this.read_header[0], this.read_header[1]]) as usize;
                    let padding_len = this.read_header[2] as usize;
                    this.read_count += 1;

                    if payload_len == 0 {
                        this.read_state = ReadState::SkipPadding {
                            remaining: padding_len,
                        };
                    } else {
                        this.read_state = ReadState::Data {
                            remaining: payload_len,
                            padding_after: padding_len,
                        };
                    }
                }

                ReadState::Data {
                    remaining,
                    padding_after,
                } => {
                    let to_read = remaining.min(buf.remaining());
                    let mut temp_buf = ReadBuf::new(buf.initialize_unfilled_to(to_read));
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = temp_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "EOF while reading padding frame payload",
                                )));
                            }
                            buf.advance(n);
                            let new_remaining = remaining - n;
                            if new_remaining == 0 {
                                this.read_state = ReadState::SkipPadding {
                                    remaining: padding_after,
                                };
                            } else {
                                this.read_state = ReadState::Data {
                                    remaining: new_remaining,
                                    padding_after,
                                };
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }

                ReadState::SkipPadding { mut remaining } => {
                    while remaining > 0 {
                        let skip_len = remaining.min(SKIP_BUF_SIZE);
                        let mut temp_buf = ReadBuf::new(&mut this.skip_buf[..skip_len]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut temp_buf) {
                            Poll::Ready(Ok(())) => {
                                let n = temp_buf.filled().len();
                                if n == 0 {
                                    this.read_state = ReadState::SkipPadding { remaining };
                                    return Poll::Ready(Ok(()));
                                }
                                remaining -= n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.read_state = ReadState::SkipPadding { remaining };
                                return Poll::Pending;
                            }
                        }
                    }

                    if this.read_count >= FIRST_PADDINGS {
                        this.read_state = ReadState::Passthrough;
                    } else {
                        this.read_state = ReadState::Header { pos: 0 };
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PaddingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match this.write_state {
                WriteState::Passthrough => {
                    return Pin::new(&mut this.inner).poll_write(cx, buf);
                }

                WriteState::Pending {
                    mut pos,
                    payload_len,
                } => {
                    while pos < this.write_buffer.len() {
                        let remaining = &this.write_buffer[pos..];
                        match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                            Poll::Ready(Ok(n)) => pos += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.write_state = WriteState::Pending { pos, payload_len };
                                return Poll::Pending;
                            }
                        }
                    }
                    this.finish_write_flush();
                    return Poll::Ready(Ok(payload_len));
                }

                WriteState::Partial { mut pos } => {
                    while pos < this.write_buffer.len() {
                        let remaining = &this.write_buffer[pos..];
                        match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                            Poll::Ready(Ok(n)) => pos += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.write_state = WriteState::Partial { pos };
                                return Poll::Pending;
                            }
                        }
                    }
                    this.finish_write_flush();
                }

                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    let payload_len = buf.len().min(MAX_PAYLOAD_SIZE);
                    let payload = &buf[..payload_len];
                    let padding_len = rand::rng().random_range(0..=MAX_PADDING) as usize;

                    this.write_buffer.clear();
                    this.write_buffer
                        .reserve(HEADER_SIZE + payload_len + padding_len);
                    this.write_buffer.put_u16(payload_len as u16);
                    this.write_buffer.put_u8(padding_len as u8);
                    this.write_buffer.put_slice(payload);
                    if padding_len > 0 {
                        let start = this.write_buffer.len();
                        this.write_buffer.resize(start + padding_len, 0);
                        rand::rng().fill(&mut this.write_buffer[start..]);
                    }

                    match Pin::new(&mut this.inner).poll_write(cx, &this.write_buffer) {
                        Poll::Ready(Ok(n)) => {
                            if n == this.write_buffer.len() {
                                this.finish_write_flush();
                            } else {
                                this.write_state = WriteState::Partial { pos: n };
                            }
                            return Poll::Ready(Ok(payload_len));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.write_state = WriteState::Pending {
                                pos: 0,
                                payload_len,
                            };
                            return Poll::Pending;
                        }
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.write_state {
            WriteState::Passthrough | WriteState::Ready => {}
            WriteState::Pending {
                mut pos,
                payload_len,
            } => {
                while pos < this.write_buffer.len() {
                    let remaining = &this.write_buffer[pos..];
                    match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                        Poll::Ready(Ok(n)) => pos += n,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.write_state = WriteState::Pending { pos, payload_len };
                            return Poll::Pending;
                        }
                    }
                }
                this.finish_write_flush();
            }
            WriteState::Partial { mut pos } => {
                while pos < this.write_buffer.len() {
                    let remaining = &this.write_buffer[pos..];
                    match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                        Poll::Ready(Ok(n)) => pos += n,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.write_state = WriteState::Partial { pos };
                            return Poll::Pending;
                        }
                    }
                }
                this.finish_write_flush();
            }
        }

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.write_state {
            WriteState::Passthrough | WriteState::Ready => {}
            WriteState::Pending { mut pos, .. } | WriteState::Partial { mut pos } => {
                while pos < this.write_buffer.len() {
                    let remaining = &this.write_buffer[pos..];
                    match Pin::new(&mut this.inner).poll_write(cx, remaining) {
                        Poll::Ready(Ok(n)) => pos += n,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {
                            this.write_state = WriteState::Partial { pos };
                            return Poll::Pending;
                        }
                    }
                }
                this.write_buffer.clear();
                this.write_state = WriteState::Ready;
            }
        }

        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_read_roundtrip() {
        let (client, server) = duplex(65536);
        let mut client_stream = PaddingStream::new(client);
        let mut server_stream = PaddingStream::new(server);

        let data = b"Hello, World!";
        client_stream.write_all(data).await.unwrap();
        client_stream.flush().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = server_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], data);
    }

    #[tokio::test]
    async fn frame_envelope_on_the_wire() {
        let (client, mut server) = duplex(65536);
        let mut client_stream = PaddingStream::new(client);

        client_stream.write_all(b"hello").await.unwrap();
        client_stream.flush().await.unwrap();
        drop(client_stream);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();

        let payload_len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        let padding_len = wire[2] as usize;
        assert_eq!(payload_len, 5);
        assert_eq!(&wire[3..8], b"hello");
        assert_eq!(wire.len(), HEADER_SIZE + payload_len + padding_len);
    }

    #[tokio::test]
    async fn bidirectional() {
        let (client, server) = duplex(65536);
        let mut client_stream = PaddingStream::new(client);
        let mut server_stream = PaddingStream::new(server);

        client_stream.write_all(b"Request").await.unwrap();
        client_stream.flush().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = server_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Request");

        server_stream.write_all(b"Response").await.unwrap();
        server_stream.flush().await.unwrap();

        let n = client_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Response");
    }

    #[tokio::test]
    async fn transparent_after_first_paddings() {
        let (client, server) = duplex(65536);
        let mut client_stream = PaddingStream::new(client);
        let mut server_stream = PaddingStream::new(server);

        let mut buf = vec![0u8; 100];
        for i in 0..FIRST_PADDINGS {
            let data = format!("Padded {}", i);
            client_stream.write_all(data.as_bytes()).await.unwrap();
            let n = server_stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], data.as_bytes());
        }

        // Both directions exhausted their write counters; traffic is raw now.
        let raw_data = b"Raw data after padding";
        client_stream.write_all(raw_data).await.unwrap();
        client_stream.flush().await.unwrap();
        let n = server_stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], raw_data);
    }

    #[tokio::test]
    async fn large_write_fragmentation() {
        let (client, server) = duplex(256 * 1024);
        let mut client_stream = PaddingStream::new(client);
        let mut server_stream = PaddingStream::new(server);

        let large_data = vec![0xABu8; 70000];
        let written = client_stream.write(&large_data).await.unwrap();
        assert!(written <= MAX_PAYLOAD_SIZE);
        client_stream.flush().await.unwrap();

        let mut buf = vec![0u8; 70000];
        let n = server_stream.read(&mut buf).await.unwrap();
        assert_eq!(n, written.min(n));
        assert_eq!(&buf[..n], &large_data[..n]);
    }

    #[tokio::test]
    async fn empty_write() {
        let (client, _server) = duplex(65536);
        let mut client_stream = PaddingStream::new(client);
        let n = client_stream.write(&[]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn padding_constants() {
        assert_eq!(FIRST_PADDINGS, 900);
        assert_eq!(MAX_PADDING, 255);
        assert_eq!(HEADER_SIZE, 3);
    }
}
