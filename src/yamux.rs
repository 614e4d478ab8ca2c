//! yamux back-end: 12-byte big-endian frame header over a single stream.
//!
//! Header: version (0), type (Data=0, WindowUpdate=1, Ping=2, GoAway=3),
//! flags (SYN=1, ACK=2, FIN=4, RST=8), stream id, length. Clients open odd
//! stream ids, servers even. Window updates are emitted for consumed data
//! and pings are answered; send pacing is left to transport backpressure.
//! Frame-level events log at trace only.
//!
//! Requires a transport with real socket addresses; wiring a pipe-like
//! connection into yamux is a programmer error and panics at construction.

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
use crate::protocol::TCP_TIMEOUT;

const YAMUX_VERSION: u8 = 0;

const TYPE_DATA: u8 = 0;
const TYPE_WINDOW_UPDATE: u8 = 1;
const TYPE_PING: u8 = 2;
const TYPE_GO_AWAY: u8 = 3;

const FLAG_SYN: u16 = 0x0001;
const FLAG_ACK: u16 = 0x0002;
const FLAG_FIN: u16 = 0x0004;
const FLAG_RST: u16 = 0x0008;

const GO_AWAY_NORMAL: u32 = 0;

const HEADER_SIZE: usize = 12;
const MAX_DATA_PAYLOAD: usize = 65535;

const FRAME_QUEUE: usize = 64;
const STREAM_QUEUE: usize = 64;
const ACCEPT_QUEUE: usize = 16;

fn encode_header(frame_type: u8, flags: u16, stream_id: u32, length: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = YAMUX_VERSION;
    header[1] = frame_type;
    header[2..4].copy_from_slice(&flags.to_be_bytes());
    header[4..8].copy_from_slice(&stream_id.to_be_bytes());
    header[8..12].copy_from_slice(&length.to_be_bytes());
    header
}

fn encode_data_frame(flags: u16, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&encode_header(
        TYPE_DATA,
        flags,
        stream_id,
        payload.len() as u32,
    ));
    buf.put_slice(payload);
    buf.freeze()
}

fn encode_control_frame(frame_type: u8, flags: u16, stream_id: u32, length: u32) -> Bytes {
    Bytes::copy_from_slice(&encode_header(frame_type, flags, stream_id, length))
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
pub struct YamuxSession {
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Bytes>,
    inbound_rx: mpsc::Receiver<YamuxStream>,
    next_stream_id: AtomicU32,
    reader_handle: tokio::task::AbortHandle,
    writer_handle: tokio::task::AbortHandle,
}

impl YamuxSession {
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

    pub async fn open(&self) -> io::Result<YamuxStream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "yamux session is closed",
            ));
        }
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);

        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        self.shared.streams.lock().insert(stream_id, data_tx);

        let syn = encode_control_frame(TYPE_WINDOW_UPDATE, FLAG_SYN, stream_id, 0);
        let sent = tokio::time::timeout(TCP_TIMEOUT, self.frame_tx.send(syn)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.shared.remove_stream(stream_id);
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "yamux session writer gone",
                ));
            }
            Err(_) => {
                self.shared.remove_stream(stream_id);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "yamux stream open timeout",
                ));
            }
        }

        trace!("yamux: opened stream {}", stream_id);
        Ok(YamuxStream::new(
            stream_id,
            data_rx,
            self.frame_tx.clone(),
            Arc::clone(&self.shared),
        ))
    }

    pub async fn accept(&mut self) -> Option<YamuxStream> {
        self.inbound_rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::Relaxed) {
            let _ = self.frame_tx.try_send(encode_control_frame(
                TYPE_GO_AWAY,
                0,
                0,
                GO_AWAY_NORMAL,
            ));
        }
        self.shared.streams.lock().clear();
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for YamuxSession {
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
            debug!("yamux: write error: {}", e);
            break;
        }
        if let Err(e) = write_half.flush().await {
            debug!("yamux: flush error: {}", e);
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
    inbound_tx: mpsc::Sender<YamuxStream>,
) {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = read_half.read_exact(&mut header).await {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                debug!("yamux: read error: {}", e);
            }
            break;
        }
        if header[0] != YAMUX_VERSION {
            debug!("yamux: unexpected version: {}", header[0]);
            break;
        }
        let frame_type = header[1];
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        if flags & FLAG_SYN != 0 && stream_id != 0 {
            let data_rx = {
                let mut streams = shared.streams.lock();
                if streams.contains_key(&stream_id) {
                    None
                } else {
                    let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
                    streams.insert(stream_id, data_tx);
                    Some(data_rx)
                }
            };
            match data_rx {
                Some(data_rx) => {
                    let stream = YamuxStream::new(
                        stream_id,
                        data_rx,
                        frame_tx.clone(),
                        Arc::clone(&shared),
                    );
                    if inbound_tx.send(stream).await.is_err() {
                        shared.remove_stream(stream_id);
                    } else {
                        let _ = frame_tx
                            .send(encode_control_frame(
                                TYPE_WINDOW_UPDATE,
                                FLAG_ACK,
                                stream_id,
                                0,
                            ))
                            .await;
                    }
                }
                None => trace!("yamux: ignoring SYN for stream {}", stream_id),
            }
        }

        match frame_type {
            TYPE_DATA => {
                let mut payload = vec![0u8; length as usize];
                if read_half.read_exact(&mut payload).await.is_err() {
                    break;
                }
                let sender = shared.streams.lock().get(&stream_id).cloned();
                match sender {
                    Some(sender) => {
                        let _ = sender.send(Bytes::from(payload)).await;
                        // Return the consumed credit to the peer.
                        let _ = frame_tx
                            .send(encode_control_frame(
                                TYPE_WINDOW_UPDATE,
                                0,
                                stream_id,
                                length,
                            ))
                            .await;
                    }
                    None => trace!("yamux: data for unknown stream {}", stream_id),
                }
            }
            TYPE_WINDOW_UPDATE => {
                // Send pacing is delegated to transport backpressure; the
                // advertised delta needs no bookkeeping here.
            }
            TYPE_PING => {
                if flags & FLAG_SYN != 0 {
                    let _ = frame_tx
                        .send(encode_control_frame(TYPE_PING, FLAG_ACK, 0, length))
                        .await;
                }
            }
            TYPE_GO_AWAY => {
                trace!("yamux: received GoAway ({})", length);
                break;
            }
            _ => {
                debug!("yamux: unknown frame type: {}", frame_type);
                break;
            }
        }

        if flags & (FLAG_FIN | FLAG_RST) != 0 && stream_id != 0 {
            shared.remove_stream(stream_id);
        }
    }
    shared.closed.store(true, Ordering::Relaxed);
    shared.streams.lock().clear();
}

/// One logical stream of a yamux session.
pub struct YamuxStream {
    stream_id: u32,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    frame_sink: PollSender<Bytes>,
    frame_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    fin_sent: bool,
}

impl YamuxStream {
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

impl AsyncRead for YamuxStream {
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

impl AsyncWrite for YamuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fin_sent || self.shared.closed.load(Ordering::Relaxed) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "yamux stream closed",
            )));
        }
        match self.frame_sink.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "yamux session writer gone",
                )));
            }
            Poll::Pending => return Poll::Pending,
        }
        let chunk = buf.len().min(MAX_DATA_PAYLOAD);
        let frame = encode_data_frame(0, self.stream_id, &buf[..chunk]);
        if self.frame_sink.send_item(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "yamux session writer gone",
            )));
        }
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match self.frame_sink.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = encode_data_frame(FLAG_FIN, self.stream_id, &[]);
                let _ = self.frame_sink.send_item(frame);
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Unpin for YamuxStream {}

impl Drop for YamuxStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.stream_id);
        if !self.fin_sent {
            let _ = self
                .frame_tx
                .try_send(encode_data_frame(FLAG_RST, self.stream_id, &[]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (YamuxSession, YamuxSession) {
        let (client_io, server_io) = duplex(256 * 1024);
        (
            YamuxSession::new(Box::new(client_io), true),
            YamuxSession::new(Box::new(server_io), false),
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
    async fn go_away_closes_peer() {
        let (client, mut server) = session_pair();

        client.close();
        // The accept loop ends once the GoAway arrives or the pipe closes.
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn header_layout() {
        let header = encode_header(TYPE_DATA, FLAG_SYN | FLAG_FIN, 7, 1024);
        assert_eq!(header[0], 0);
        assert_eq!(header[1], TYPE_DATA);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 0x0005);
        assert_eq!(u32::from_be_bytes([header[4], header[5], header[6], header[7]]), 7);
        assert_eq!(
            u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
            1024
        );
    }
}
