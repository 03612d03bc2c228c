//! Raw TCP transport
//!
//! Frames are delimited purely by the u32 length prefix, reassembled with
//! the incremental [`FrameDecoder`]. Keepalive is enabled on accepted
//! sockets so half-dead peers surface as closed connections.

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};
use crate::TransportOptions;

use clasp_core::{frame, FrameDecoder};

const READ_CHUNK: usize = 16 * 1024;

pub struct TcpSink {
    tx: mpsc::Sender<Bytes>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(frame::encode_frame(&payload))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

pub struct TcpSource {
    rx: mpsc::Receiver<ConnEvent>,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

fn spawn_io(stream: TcpStream, max_frame: usize) -> (Arc<dyn FrameSink>, BoxSource) {
    let (read_half, write_half) = stream.into_split();
    let (send_tx, send_rx) = mpsc::channel::<Bytes>(256);
    let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(256);

    let open = Arc::new(AtomicBool::new(true));

    tokio::spawn(writer_loop(write_half, send_rx, open.clone()));
    tokio::spawn(reader_loop(read_half, event_tx, open.clone(), max_frame));

    (
        Arc::new(TcpSink { tx: send_tx, open }),
        Box::new(TcpSource { rx: event_rx }),
    )
}

async fn writer_loop(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    open: Arc<AtomicBool>,
) {
    while let Some(framed) = rx.recv().await {
        if write.write_all(&framed).await.is_err() {
            break;
        }
    }
    open.store(false, Ordering::Release);
    let _ = write.shutdown().await;
}

async fn reader_loop(
    mut read: OwnedReadHalf,
    event_tx: mpsc::Sender<ConnEvent>,
    open: Arc<AtomicBool>,
    max_frame: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame);
    let mut chunk = vec![0u8; READ_CHUNK];

    'io: loop {
        match read.read(&mut chunk).await {
            Ok(0) => {
                let _ = event_tx.send(ConnEvent::Closed(None)).await;
                break;
            }
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(payload)) => {
                            if event_tx.send(ConnEvent::Frame(payload)).await.is_err() {
                                break 'io;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("dropping tcp connection on bad frame: {e}");
                            let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                            break 'io;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
}

fn enable_keepalive(stream: &TcpStream) {
    let ka = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
        debug!("keepalive not enabled: {e}");
    }
}

/// Length-prefixed TCP listener
pub struct TcpFrameListener {
    listener: TcpListener,
    options: TransportOptions,
}

impl TcpFrameListener {
    pub async fn bind(addr: &str, options: TransportOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        info!("tcp listening on {addr}");
        Ok(Self { listener, options })
    }
}

#[async_trait]
impl Listener for TcpFrameListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        enable_keepalive(&stream);

        let (sink, source) = spawn_io(stream, self.options.max_frame);
        Ok(Accepted { sink, source, peer })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connect to a CLASP TCP endpoint.
pub async fn connect_tcp(
    addr: &str,
    options: TransportOptions,
) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    stream.set_nodelay(true).ok();
    Ok(spawn_io(stream, options.max_frame))
}
