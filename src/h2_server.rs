//! H2-CONNECT server back-end.
//!
//! Accepts CONNECT streams off one HTTP/2 connection, answers `200 OK`,
//! and hands the body pair to the caller through an inbound channel whose
//! close signals shutdown. Sessions idle out after 30 seconds.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Response;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::async_stream::AsyncStream;
use crate::h2_client::{MAX_FRAME_SIZE, WINDOW_SIZE};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const INBOUND_BUFFER: usize = 32;

/// Server session accepting multiplexed streams.
pub struct H2ServerSession {
    inbound_rx: mpsc::Receiver<H2Stream>,
    is_closed: Arc<AtomicBool>,
    accept_handle: tokio::task::AbortHandle,
}

impl H2ServerSession {
    pub async fn new(conn: Box<dyn AsyncStream>) -> io::Result<Self> {
        let connection = h2::server::Builder::new()
            .initial_window_size(WINDOW_SIZE)
            .initial_connection_window_size(WINDOW_SIZE)
            .max_frame_size(MAX_FRAME_SIZE)
            .handshake(conn)
            .await
            .map_err(|e| io::Error::other(format!("h2 server handshake failed: {}", e)))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let is_closed = Arc::new(AtomicBool::new(false));

        let is_closed_clone = Arc::clone(&is_closed);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(connection, inbound_tx).await;
            is_closed_clone.store(true, Ordering::Relaxed);
        })
        .abort_handle();

        Ok(Self {
            inbound_rx,
            is_closed,
            accept_handle,
        })
    }

    async fn accept_loop(
        mut connection: h2::server::Connection<Box<dyn AsyncStream>, Bytes>,
        inbound_tx: mpsc::Sender<H2Stream>,
    ) {
        let mut idle_timer = interval(IDLE_TIMEOUT);
        idle_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it.
        idle_timer.tick().await;

        loop {
            tokio::select! {
                result = connection.accept() => {
                    match result {
                        Some(Ok((request, mut respond))) => {
                            idle_timer.reset();
                            let response = match Response::builder()
                                .status(http::StatusCode::OK)
                                .body(())
                            {
                                Ok(response) => response,
                                Err(e) => {
                                    debug!("h2 server: response build failed: {}", e);
                                    continue;
                                }
                            };
                            let send_stream = match respond.send_response(response, false) {
                                Ok(send_stream) => send_stream,
                                Err(e) => {
                                    debug!("h2 server: send response failed: {}", e);
                                    continue;
                                }
                            };
                            let stream = H2Stream::new(send_stream, request.into_body());
                            if inbound_tx.send(stream).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("h2 server: accept error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }

                _ = idle_timer.tick() => {
                    debug!("h2 server: idle timeout, shutting down gracefully");
                    connection.graceful_shutdown();
                    // Drain streams that raced the GOAWAY.
                    while let Some(result) = connection.accept().await {
                        match result {
                            Ok((request, mut respond)) => {
                                let Ok(response) = Response::builder()
                                    .status(http::StatusCode::OK)
                                    .body(())
                                else {
                                    continue;
                                };
                                let Ok(send_stream) = respond.send_response(response, false)
                                else {
                                    continue;
                                };
                                let stream = H2Stream::new(send_stream, request.into_body());
                                if inbound_tx.send(stream).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("h2 server: error during drain: {}", e);
                                break;
                            }
                        }
                    }
                    break;
                }
            }
        }

        debug!("h2 server: accept loop ended");
    }

    /// Next inbound stream, or None when the session has shut down.
    pub async fn accept(&mut self) -> Option<H2Stream> {
        self.inbound_rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.is_closed.store(true, Ordering::Relaxed);
        self.accept_handle.abort();
    }
}

impl Drop for H2ServerSession {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

/// AsyncRead/AsyncWrite adapter over an h2 send/recv pair.
pub struct H2Stream {
    send: h2::SendStream<Bytes>,
    recv: h2::RecvStream,
    recv_buf: Bytes,
    shutdown_sent: bool,
}

impl H2Stream {
    pub fn new(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> Self {
        Self {
            send,
            recv,
            recv_buf: Bytes::new(),
            shutdown_sent: false,
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.recv_buf.is_empty() {
            let to_copy = self.recv_buf.len().min(buf.remaining());
            buf.put_slice(&self.recv_buf[..to_copy]);
            self.recv_buf = self.recv_buf.slice(to_copy..);
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.recv).poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let len = data.len();
                let _ = self.recv.flow_control().release_capacity(len);

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

impl AsyncWrite for H2Stream {
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

impl Unpin for H2Stream {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2_client::H2ClientSession;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_round_trip() {
        let (client_io, server_io) = duplex(256 * 1024);

        let (client, server) = tokio::join!(
            H2ClientSession::new(Box::new(client_io)),
            H2ServerSession::new(Box::new(server_io)),
        );
        let client = client.unwrap();
        let mut server = server.unwrap();

        let mut client_stream = client.open().unwrap();
        client_stream.write_all(b"ping").await.unwrap();

        let mut server_stream = server.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_stream.write_all(b"pong").await.unwrap();
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn multiple_streams_one_connection() {
        let (client_io, server_io) = duplex(256 * 1024);

        let (client, server) = tokio::join!(
            H2ClientSession::new(Box::new(client_io)),
            H2ServerSession::new(Box::new(server_io)),
        );
        let client = client.unwrap();
        let mut server = server.unwrap();

        let mut streams = Vec::new();
        for i in 0..3u8 {
            let mut stream = client.open().unwrap();
            stream.write_all(&[i]).await.unwrap();
            streams.push(stream);
        }

        for _ in 0..3 {
            let mut server_stream = server.accept().await.unwrap();
            let mut buf = [0u8; 1];
            server_stream.read_exact(&mut buf).await.unwrap();
            assert!(buf[0] < 3);
        }
    }
}
