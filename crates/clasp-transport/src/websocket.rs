//! WebSocket transport
//!
//! The mandatory baseline transport. Frames travel as RFC 6455 binary
//! messages, one wire frame per message; the `clasp.v3` subprotocol is
//! negotiated on upgrade.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        handshake::server::{Request as HsRequest, Response as HsResponse},
        http::Request,
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};
use crate::TransportOptions;

use clasp_core::{frame, WS_SUBPROTOCOL};

pub struct WsSink {
    tx: mpsc::Sender<WsMessage>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let framed = frame::encode_frame(&payload);
        self.tx
            .send(WsMessage::Binary(framed.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        let _ = self.tx.send(WsMessage::Close(None)).await;
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

pub struct WsSource {
    rx: mpsc::Receiver<ConnEvent>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

/// Bridge a connected WebSocket stream into sink/source halves.
fn spawn_io<S>(stream: tokio_tungstenite::WebSocketStream<S>, max_frame: usize) -> (Arc<dyn FrameSink>, BoxSource)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = stream.split();
    let (send_tx, mut send_rx) = mpsc::channel::<WsMessage>(256);
    let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(256);

    let open = Arc::new(AtomicBool::new(true));

    let open_w = open.clone();
    tokio::spawn(async move {
        while let Some(msg) = send_rx.recv().await {
            let is_close = matches!(msg, WsMessage::Close(_));
            if write.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        open_w.store(false, Ordering::Release);
    });

    let open_r = open.clone();
    tokio::spawn(async move {
        while let Some(result) = read.next().await {
            match result {
                Ok(WsMessage::Binary(data)) => match frame::decode_frame(&data, max_frame) {
                    Ok(payload) => {
                        if event_tx.send(ConnEvent::Frame(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("dropping connection on bad frame: {e}");
                        let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                        break;
                    }
                },
                Ok(WsMessage::Close(cf)) => {
                    let reason = cf.map(|f| f.reason.to_string());
                    let _ = event_tx.send(ConnEvent::Closed(reason)).await;
                    break;
                }
                Ok(WsMessage::Text(_)) => {
                    // Binary-only protocol
                    let _ = event_tx
                        .send(ConnEvent::Closed(Some("text frame on binary protocol".into())))
                        .await;
                    break;
                }
                Ok(_) => {} // ping/pong handled by tungstenite
                Err(e) => {
                    let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                    break;
                }
            }
        }
        open_r.store(false, Ordering::Release);
    });

    (
        Arc::new(WsSink { tx: send_tx, open }),
        Box::new(WsSource { rx: event_rx }),
    )
}

/// WebSocket listener
pub struct WsListener {
    listener: TcpListener,
    options: TransportOptions,
}

impl WsListener {
    pub async fn bind(addr: &str, options: TransportOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        info!("websocket listening on {addr}");
        Ok(Self { listener, options })
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;

        let ws_stream = accept_with_subprotocol(stream).await?;
        debug!("websocket client connected from {peer}");

        let (sink, source) = spawn_io(ws_stream, self.options.max_frame);
        Ok(Accepted { sink, source, peer })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn accept_with_subprotocol(
    stream: TcpStream,
) -> Result<tokio_tungstenite::WebSocketStream<TcpStream>> {
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &HsRequest, mut response: HsResponse| {
        if let Some(protocols) = req.headers().get("Sec-WebSocket-Protocol") {
            if let Ok(protocols_str) = protocols.to_str() {
                let requested: Vec<&str> = protocols_str.split(',').map(|s| s.trim()).collect();
                if requested.contains(&WS_SUBPROTOCOL) {
                    response
                        .headers_mut()
                        .insert("Sec-WebSocket-Protocol", WS_SUBPROTOCOL.parse().unwrap());
                }
            }
        }
        Ok(response)
    })
    .await
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(ws)
}

/// Connect to a CLASP WebSocket endpoint (`ws://` or `wss://` URL).
pub async fn connect_ws(
    url: &str,
    options: TransportOptions,
) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
    let request = Request::builder()
        .uri(url)
        .header("Sec-WebSocket-Protocol", WS_SUBPROTOCOL)
        .body(())
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    let (ws_stream, response) = connect_async(request).await?;
    debug!("websocket connected, status {:?}", response.status());

    Ok(spawn_io(ws_stream, options.max_frame))
}
