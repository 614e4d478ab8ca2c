//! Transport wrapper that fuses the session request into the first write.
//!
//! The session request must precede all multiplexer bytes, but sending it
//! eagerly would cost an extra syscall and a distinctive first packet.
//! Instead the encoded request rides in front of the first payload write:
//! as a separate slice when the transport supports vectored writes, or in
//! one combined buffer otherwise.

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::SessionRequest;

pub struct RequestStream<S> {
    inner: S,
    /// Unsent portion of the encoded session request; None once written.
    request: Option<Bytes>,
    /// Combined request+payload buffer mid-flush: (buffer, payload_len, sent)
    pending: Option<(Bytes, usize, usize)>,
}

impl<S> RequestStream<S> {
    pub fn new(inner: S, request: SessionRequest) -> Self {
        let mut buf = BytesMut::with_capacity(request.encoded_len());
        request.encode(&mut buf);
        Self {
            inner,
            request: Some(buf.freeze()),
            pending: None,
        }
    }

    /// True until the session request has gone out.
    pub fn need_handshake(&self) -> bool {
        self.request.is_some()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Unpin> Unpin for RequestStream<S> {}

impl<S: AsyncRead + Unpin> AsyncRead for RequestStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RequestStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            // Flush a partially written fused buffer before anything else.
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

            let Some(request) = this.request.take() else {
                return Pin::new(&mut this.inner).poll_write(cx, buf);
            };

            if this.inner.is_write_vectored() {
                let slices = [IoSlice::new(&request), IoSlice::new(buf)];
                match Pin::new(&mut this.inner).poll_write_vectored(cx, &slices) {
                    Poll::Ready(Ok(n)) => {
                        if n >= request.len() {
                            let payload_written = n - request.len();
                            if payload_written > 0 {
                                return Poll::Ready(Ok(payload_written));
                            }
                            // Request went out alone; write the payload plainly.
                            continue;
                        }
                        this.request = Some(request.slice(n..));
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        this.request = Some(request);
                        return Poll::Pending;
                    }
                }
            }

            let mut combined = BytesMut::with_capacity(request.len() + buf.len());
            combined.extend_from_slice(&request);
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

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.request.is_none() && this.pending.is_none() {
            return Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        }
        // Fall back to the fused single-buffer path for the first write.
        let first = bufs.iter().find(|b| !b.is_empty()).map_or(&[][..], |b| &b[..]);
        Pin::new(this).poll_write(cx, first)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
