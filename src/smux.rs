//! smux back-end: version 1 framing over a single byte stream.
//!
//! Segment format (8-byte header + payload):
//! - byte 0: version (1)
//! - byte 1: command (SYN=0, FIN=1, PSH=2, NOP=3)
//! - bytes 2-3: payload length (little-endian)
//! - bytes 4-7: stream id (little-endian)
//!
//! A writer task owns the write half and serializes outgoing frames; the
//! read loop dispatches PSH payloads to per-stream channels. Keep-alive is
//! disabled: NOP frames are accepted but never sent.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::async_stream::AsyncStream;

const SMUX_VERSION: u8 = 1;

const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

const HEADER_SIZE: usize = 8;
const MAX_SEGMENT_PAYLOAD: usize = 65535;

/// Outgoing frame queue depth before writers block.
const FRAME_QUEUE: usize = 64;
/// Per-stream inbound payload queue depth.
const STREAM_QUEUE: usize = 64;
const ACCEPT_QUEUE: usize = 16;

fn encode_frame(cmd: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(SMUX_VERSION);
    buf.put_u8(cmd);
    buf.put_u16_le(payload.len() as u16);
    buf.put_u32_le(stream_id);
    buf.put_slice(payload);
    buf.freeze()
}

struct Shared {
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl Shared {
    fn remove_stream(&self, stream_id: u32) {
        self.streams.lock().remove(&stream_id);
    }
}

/// A multiplexed session over one byte stream.
pub struct SmuxSession {
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Bytes>,
    inbound_rx: mpsc::Receiver<SmuxStream>,
    next_stream_id: AtomicU32,
    reader_handle: tokio::task::AbortHandle,
    writer_handle: tokio::task::AbortHandle,
}

impl SmuxSession {
    /// Client sessions open odd stream ids, servers even.
    pub fn new(conn: Box<dyn AsyncStream>, is_client: bool) -> Self {
        let (read_half, write_half) = tokio::io::split(conn);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(ACCEPT_QUEUE);

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let writer_handle = {
            let shared = Arc::clone(&shared);
            tokio::spawn(run_writer(frame_rx, write_half, shared)).abort_handle()
        };
        let reader_handle = {
            let shared = Arc::clone(&shared);
            let frame_tx = frame_tx.clone();
            tokio::spawn(run_reader(read_half, shared, frame_tx, inbound_tx)).abort_handle()
        };

        Self {
            shared,
            frame_tx,
            inbound_rx,
            next_stream_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            reader_handle,
            writer_handle,
        }
    }

    pub async fn open(&self) -> io::Result<SmuxStream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "smux session is closed",
            ));
        }
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);

        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        self.shared.streams.lock().insert(stream_id, data_tx);

        self.frame_tx
            .send(encode_frame(CMD_SYN, stream_id, &[]))
            .await
            .map_err(|_| {
                self.shared.remove_stream(stream_id);
                io::Error::new(io::ErrorKind::BrokenPipe, "smux session writer gone")
            })?;

        trace!("smux: opened stream {}", stream_id);
        Ok(SmuxStream::new(
            stream_id,
            data_rx,
            self.frame_tx.clone(),
            Arc::clone(&self.shared),
        ))
    }

    /// Next peer-opened stream, or None when the session has shut down.
    pub async fn accept(&mut self) -> Option<SmuxStream> {
        self.inbound_rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared.streams.lock().clear();
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for SmuxSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    mut frame_rx: mpsc::Receiver<Bytes>,
    mut write_half: tokio::io::WriteHalf<Box<dyn AsyncStream>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            debug!("smux: write error: {}", e);
            break;
        }
        if let Err(e) = write_half.flush().await {
            debug!("smux: flush error: {}", e);
            break;
        }
    }
    shared.closed.store(true, Ordering::Relaxed);
    shared.streams.lock().clear();
    let _ = write_half.shutdown().await;
}

async fn run_reader(
    mut read_half: tokio::io::ReadHalf<Box<dyn AsyncStream>>,
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Bytes>,
    inbound_tx: mpsc::Sender<SmuxStream>,
) {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = read_half.read_exact(&mut header).await {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                debug!("smux: read error: {}", e);
            }
            break;
        }
        if header[0] != SMUX_VERSION {
            debug!("smux: unexpected version: {}", header[0]);
            break;
        }
        let cmd = header[1];
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let stream_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        match cmd {
            CMD_SYN => {
                let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
                {
                    let mut streams = shared.streams.lock();
                    if streams.contains_key(&stream_id) {
                        debug!("smux: duplicate SYN for stream {}", stream_id);
                        continue;
                    }
                    streams.insert(stream_id, data_tx);
                }
                let stream = SmuxStream::new(
                    stream_id,
                    data_rx,
                    frame_tx.clone(),
                    Arc::clone(&shared),
                );
                if inbound_tx.send(stream).await.is_err() {
                    shared.remove_stream(stream_id);
                }
            }
            CMD_PSH => {
                let mut payload = vec![0u8; len];
                if read_half.read_exact(&mut payload).await.is_err() {
                    break;
                }
                let sender = shared.streams.lock().get(&stream_id).cloned();
                match sender {
                    Some(sender) => {
                        // Stream may have been dropped locally; discard then.
                        let _ = sender.send(Bytes::from(payload)).await;
                    }
                    None => trace!("smux: data for unknown stream {}", stream_id),
                }
            }
            CMD_FIN => {
                shared.remove_stream(stream_id);
            }
            CMD_NOP => {}
            _ => {
                debug!("smux: unknown command: {}", cmd);
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::Relaxed);
    shared.streams.lock().clear();
}

/// One logical stream of a smux session.
pub struct SmuxStream {
    stream_id: u32,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    frame_sink: PollSender<Bytes>,
    frame_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    fin_sent: bool,
}

impl SmuxStream {
    fn new(
        stream_id: u32,
        data_rx: mpsc::Receiver<Bytes>,
        frame_tx: mpsc::Sender<Bytes>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            stream_id,
            data_rx,
            read_buf: Bytes::new(),
            frame_sink: PollSender::new(frame_tx.clone()),
            frame_tx,
            shared,
            fin_sent: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for SmuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let to_copy = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..to_copy]);
                self.read_buf = self.read_buf.slice(to_copy..);
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    self.read_buf = data;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for SmuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fin_sent || self.shared.closed.load(Ordering::Relaxed) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "smux stream closed",
            )));
        }
        match self.frame_sink.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "smux session writer gone",
                )));
            }
            Poll::Pending => return Poll::Pending,
        }
        let chunk = buf.len().min(MAX_SEGMENT_PAYLOAD);
        let frame = encode_frame(CMD_PSH, self.stream_id, &buf[..chunk]);
        if self.frame_sink.send_item(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "smux session writer gone",
            )));
        }
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match self.frame_sink.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = encode_frame(CMD_FIN, self.stream_id, &[]);
                let _ = self.frame_sink.send_item(frame);
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            // Writer gone: nothing left to close.
            Poll::Ready(Err(_)) => {
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Unpin for SmuxStream {}

impl Drop for SmuxStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.stream_id);
        if !self.fin_sent {
            let _ = self
                .frame_tx
                .try_send(encode_frame(CMD_FIN, self.stream_id, &[]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (SmuxSession, SmuxSession) {
        let (client_io, server_io) = duplex(256 * 1024);
        (
            SmuxSession::new(Box::new(client_io), true),
            SmuxSession::new(Box::new(server_io), false),
        )
    }

    #[tokio::test]
    async fn open_accept_round_trip() {
        let (client, mut server) = session_pair();

        let mut client_stream = client.open().await.unwrap();
        client_stream.write_all(b"hello").await.unwrap();

        let mut server_stream = server.accept().await.unwrap();
        let mut buf = [0u8; 5];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_stream.write_all(b"world").await.unwrap();
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn interleaved_streams() {
        let (client, mut server) = session_pair();

        let mut s1 = client.open().await.unwrap();
        let mut s2 = client.open().await.unwrap();
        assert_ne!(s1.stream_id(), s2.stream_id());

        s1.write_all(b"first").await.unwrap();
        s2.write_all(b"second").await.unwrap();

        let mut a1 = server.accept().await.unwrap();
        let mut a2 = server.accept().await.unwrap();

        let mut buf1 = [0u8; 5];
        a1.read_exact(&mut buf1).await.unwrap();
        assert_eq!(&buf1, b"first");
        let mut buf2 = [0u8; 6];
        a2.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"second");
    }

    #[tokio::test]
    async fn fin_propagates_as_eof() {
        let (client, mut server) = session_pair();

        let mut client_stream = client.open().await.unwrap();
        client_stream.write_all(b"bye").await.unwrap();
        client_stream.shutdown().await.unwrap();

        let mut server_stream = server.accept().await.unwrap();
        let mut buf = Vec::new();
        server_stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");
    }

    #[tokio::test]
    async fn session_close_marks_closed() {
        let (client, server) = session_pair();
        assert!(!client.is_closed());
        client.close();
        assert!(client.is_closed());
        assert!(client.open().await.is_err());
        drop(server);
    }

    #[tokio::test]
    async fn large_transfer_chunks() {
        let (client, mut server) = session_pair();

        let data = vec![0x5Au8; 200_000];
        let mut client_stream = client.open().await.unwrap();
        let data_clone = data.clone();
        let writer = tokio::spawn(async move {
            client_stream.write_all(&data_clone).await.unwrap();
            client_stream.shutdown().await.unwrap();
        });

        let mut server_stream = server.accept().await.unwrap();
        let mut received = Vec::new();
        server_stream.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, data);
    }
}
