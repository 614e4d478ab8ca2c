//! H2-CONNECT client back-end.
//!
//! One HTTP/2 connection carries many logical streams, each the body pair
//! of a single CONNECT request to `https://localhost`. Streams open lazily:
//! the request goes out immediately and the response body is resolved on
//! first read, bounded by a 10 second handshake timeout.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use h2::client::ResponseFuture;
use http::{Method, Request, Version};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::async_stream::AsyncStream;

/// Window and frame sizing shared with the server side.
pub(crate) const WINDOW_SIZE: u32 = 1024 * 1024;
pub(crate) const MAX_FRAME_SIZE: u32 = 16384;

/// Bound on the CONNECT round trip for a newly opened stream.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client session multiplexing streams over one HTTP/2 connection.
pub struct H2ClientSession {
    send_request: h2::client::SendRequest<Bytes>,
    driver: DriverHandle,
    closed: Arc<AtomicBool>,
}

/// Aborts the connection driver when the session is dropped.
struct DriverHandle(tokio::task::AbortHandle);

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl H2ClientSession {
    pub async fn new(conn: Box<dyn AsyncStream>) -> io::Result<Self> {
        let (send_request, connection) = h2::client::Builder::new()
            .initial_window_size(WINDOW_SIZE)
            .initial_connection_window_size(WINDOW_SIZE)
            .max_frame_size(MAX_FRAME_SIZE)
            .handshake(conn)
            .await
            .map_err(|e| io::Error::other(format!("h2 client handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = Arc::clone(&closed);
        let abort_handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 client connection ended: {}", e);
            }
            closed_clone.store(true, Ordering::Relaxed);
        })
        .abort_handle();

        Ok(Self {
            send_request,
            driver: DriverHandle(abort_handle),
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// H2 sessions stop taking new requests once the connection reports
    /// closing; the pool then opens a replacement session.
    pub fn can_take_new_request(&self) -> bool {
        !self.is_closed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.driver.0.abort();
    }

    /// Open a logical stream. Returns immediately; the CONNECT response is
    /// awaited on first read.
    pub fn open(&self) -> io::Result<H2ClientStream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "h2 session is closed",
            ));
        }

        let http_request = Request::builder()
            .method(Method::CONNECT)
            .uri("https://localhost")
            .version(Version::HTTP_2)
            .body(())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let (response_future, send_stream) = self
            .send_request
            .clone()
            .send_request(http_request, false)
            .map_err(|e| {
                self.closed.store(true, Ordering::Relaxed);
                io::Error::other(format!("failed to send CONNECT: {}", e))
            })?;

        Ok(H2ClientStream::new(send_stream, response_future))
    }
}

/// Client-side logical stream with lazy response resolution.
pub struct H2ClientStream {
    send: h2::SendStream<Bytes>,
    /// Resolved receive half; None until the CONNECT response arrives.
    recv: Option<h2::RecvStream>,
    recv_pending: Option<oneshot::Receiver<io::Result<h2::RecvStream>>>,
    recv_buf: Bytes,
    shutdown_sent: bool,
}

impl H2ClientStream {
    fn new(send: h2::SendStream<Bytes>, response_future: ResponseFuture) -> Self {
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, response_future).await {
                Ok(Ok(response)) => {
                    if response.status() == http::StatusCode::OK {
                        Ok(response.into_body())
                    } else {
                        Err(io::Error::other(format!(
                            "CONNECT failed with status: {}",
                            response.status()
                        )))
                    }
                }
                Ok(Err(e)) => Err(io::Error::other(format!("CONNECT response error: {}", e))),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "CONNECT handshake timeout",
                )),
            };
            let _ = tx.send(result);
        });

        Self {
            send,
            recv: None,
            recv_pending: Some(rx),
            recv_buf: Bytes::new(),
            shutdown_sent: false,
        }
    }

    fn poll_resolve_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.recv.is_some() {
            return Poll::Ready(Ok(()));
        }
        let Some(rx) = self.recv_pending.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "CONNECT response already failed",
            )));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(Ok(recv))) => {
                self.recv = Some(recv);
                self.recv_pending = None;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(Err(e))) => {
                self.recv_pending = None;
                Poll::Ready(Err(e))
            }
            Poll::Ready(Err(_)) => {
                self.recv_pending = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "CONNECT response channel closed",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for H2ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.recv.is_none() {
            match self.poll_resolve_recv(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        if !self.recv_buf.is_empty() {
            let to_copy = self.recv_buf.len().min(buf.remaining());
            buf.put_slice(&self.recv_buf[..to_copy]);
            self.recv_buf = self.recv_buf.slice(to_copy..);
            return Poll::Ready(Ok(()));
        }

        let recv = self.recv.as_mut().unwrap();
        match Pin::new(recv).poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let len = data.len();
                let _ = self
                    .recv
                    .as_mut()
                    .unwrap()
                    .flow_control()
                    .release_capacity(len);

                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);
                if to_copy < data.len() {
                    self.recv_buf = data.slice(to_copy..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for H2ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.send.capacity() < buf.len() {
            self.send.reserve_capacity(buf.len());
        }
        match self.send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(capacity))) => {
                let to_send = buf.len().min(capacity);
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..to_send]), false)
                    .map_err(io::Error::other)?;
                Poll::Ready(Ok(to_send))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "h2 stream closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // h2 has no per-stream flush; DATA frames leave as they are sent.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.shutdown_sent {
            match self.send.send_data(Bytes::new(), true) {
                Ok(()) => self.shutdown_sent = true,
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
        match self.send.poll_reset(cx) {
            Poll::Ready(_) | Poll::Pending => Poll::Ready(Ok(())),
        }
    }
}

impl Unpin for H2ClientStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_stream_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<H2ClientStream>();
        assert_send::<H2ClientSession>();
    }
}
