//! UDP transport
//!
//! One datagram carries exactly one wire frame. The listener owns a single
//! socket and demultiplexes datagrams by source tuple into per-peer
//! connection handles; a datagram from an unknown tuple surfaces as a new
//! accepted connection.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};
use crate::TransportOptions;

use clasp_core::frame;

/// Largest practical datagram; frames beyond this must use a stream
/// transport.
pub const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let framed = frame::encode_frame(&payload);
        if framed.len() > MAX_DATAGRAM {
            return Err(TransportError::SendFailed(format!(
                "frame of {} bytes exceeds datagram limit",
                framed.len()
            )));
        }
        self.socket
            .send_to(&framed, self.peer)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

pub struct UdpSource {
    rx: mpsc::Receiver<ConnEvent>,
}

#[async_trait]
impl FrameSource for UdpSource {
    async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

/// UDP listener with per-source-tuple sessions
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    incoming: Mutex<mpsc::Receiver<Accepted>>,
}

impl UdpListener {
    pub async fn bind(addr: &str, options: TransportOptions) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| TransportError::BindFailed(e.to_string()))?,
        );
        info!("udp listening on {addr}");

        let (accept_tx, incoming) = mpsc::channel(64);
        tokio::spawn(demux_loop(socket.clone(), accept_tx, options.max_frame));

        Ok(Self {
            socket,
            incoming: Mutex::new(incoming),
        })
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::Sender<Accepted>,
    max_frame: usize,
) {
    let peers: DashMap<SocketAddr, mpsc::Sender<ConnEvent>> = DashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("udp receive error: {e}");
                break;
            }
        };

        let payload = match frame::decode_frame(&buf[..n], max_frame) {
            Ok(p) => p,
            Err(e) => {
                debug!("discarding bad datagram from {peer}: {e}");
                continue;
            }
        };

        // Existing peer: forward. Send failure means its handle was
        // dropped, so the tuple starts a fresh session below.
        if let Some(tx) = peers.get(&peer).map(|t| t.value().clone()) {
            if tx.send(ConnEvent::Frame(payload.clone())).await.is_ok() {
                continue;
            }
            peers.remove(&peer);
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let sink = Arc::new(UdpSink {
            socket: socket.clone(),
            peer,
            open: Arc::new(AtomicBool::new(true)),
        });
        let accepted = Accepted {
            sink,
            source: Box::new(UdpSource { rx: event_rx }),
            peer,
        };
        if event_tx.send(ConnEvent::Frame(payload)).await.is_err() {
            continue;
        }
        if accept_tx.send(accepted).await.is_err() {
            break;
        }
        peers.insert(peer, event_tx);
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&mut self) -> Result<Accepted> {
        self.incoming.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        self.incoming.lock().await.close();
        Ok(())
    }
}

/// Connect to a CLASP UDP endpoint.
pub async fn connect_udp(
    addr: &str,
    options: TransportOptions,
) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?,
    );
    socket
        .connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let peer = socket.peer_addr()?;

    let (event_tx, event_rx) = mpsc::channel(256);
    let recv_socket = socket.clone();
    let max_frame = options.max_frame;
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match recv_socket.recv(&mut buf).await {
                Ok(n) => match frame::decode_frame(&buf[..n], max_frame) {
                    Ok(payload) => {
                        if event_tx.send(ConnEvent::Frame(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("discarding bad datagram: {e}"),
                },
                Err(e) => {
                    let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                    break;
                }
            }
        }
    });

    let sink = Arc::new(UdpSink {
        socket,
        peer,
        open: Arc::new(AtomicBool::new(true)),
    });
    Ok((sink, Box::new(UdpSource { rx: event_rx })))
}
