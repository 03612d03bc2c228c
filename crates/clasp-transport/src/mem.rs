//! In-process transport
//!
//! A pair of channel-bridged endpoints with the same contract as the
//! network transports. Used by the test suites and by bridge adapters that
//! attach to a router living in the same process.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, TransportError};
use crate::traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};

const CHANNEL_CAPACITY: usize = 256;

pub struct MemSink {
    tx: mpsc::Sender<ConnEvent>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemSink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(ConnEvent::Frame(payload))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ConnEvent::Closed(None)).await;
        }
        Ok(())
    }
}

pub struct MemSource {
    rx: mpsc::Receiver<ConnEvent>,
}

#[async_trait]
impl FrameSource for MemSource {
    async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

/// Build two connected endpoints. Frames sent on one sink arrive on the
/// other side's source.
pub fn mem_pair() -> (
    (Arc<dyn FrameSink>, BoxSource),
    (Arc<dyn FrameSink>, BoxSource),
) {
    let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let open = Arc::new(AtomicBool::new(true));

    let a_sink: Arc<dyn FrameSink> = Arc::new(MemSink {
        tx: a_tx,
        open: open.clone(),
    });
    let b_sink: Arc<dyn FrameSink> = Arc::new(MemSink { tx: b_tx, open });

    (
        (a_sink, Box::new(MemSource { rx: a_rx })),
        (b_sink, Box::new(MemSource { rx: b_rx })),
    )
}

/// Accept side of the in-memory transport
pub struct MemListener {
    incoming: Mutex<mpsc::Receiver<Accepted>>,
}

/// Connect side of the in-memory transport; cheap to clone
#[derive(Clone)]
pub struct MemDialer {
    accept_tx: mpsc::Sender<Accepted>,
}

impl MemListener {
    pub fn new() -> (Self, MemDialer) {
        let (accept_tx, incoming) = mpsc::channel(16);
        (
            Self {
                incoming: Mutex::new(incoming),
            },
            MemDialer { accept_tx },
        )
    }
}

impl MemDialer {
    /// Open a new in-memory connection to the listener.
    pub async fn connect(&self) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
        let (client, server) = mem_pair();
        let accepted = Accepted {
            sink: server.0,
            source: server.1,
            peer: mem_addr(),
        };
        self.accept_tx
            .send(accepted)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(client)
    }
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&mut self) -> Result<Accepted> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(mem_addr())
    }

    async fn close(&self) -> Result<()> {
        self.incoming.lock().await.close();
        Ok(())
    }
}

fn mem_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_directions() {
        let ((a_sink, mut a_src), (b_sink, mut b_src)) = mem_pair();

        a_sink.send(Bytes::from_static(b"ping")).await.unwrap();
        match b_src.recv().await {
            Some(ConnEvent::Frame(f)) => assert_eq!(f.as_ref(), b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }

        b_sink.send(Bytes::from_static(b"pong")).await.unwrap();
        match a_src.recv().await {
            Some(ConnEvent::Frame(f)) => assert_eq!(f.as_ref(), b"pong"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_reaches_peer() {
        let ((a_sink, _a_src), (_b_sink, mut b_src)) = mem_pair();
        a_sink.close().await.unwrap();
        assert!(matches!(b_src.recv().await, Some(ConnEvent::Closed(_))));
        assert!(a_sink.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn listener_accepts_dialed_connections() {
        let (mut listener, dialer) = MemListener::new();

        let (sink, mut src) = dialer.connect().await.unwrap();
        let accepted = listener.accept().await.unwrap();

        sink.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut server_src = accepted.source;
        match server_src.recv().await {
            Some(ConnEvent::Frame(f)) => assert_eq!(f.as_ref(), b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        accepted.sink.send(Bytes::from_static(b"hi")).await.unwrap();
        assert!(matches!(src.recv().await, Some(ConnEvent::Frame(_))));
    }
}
