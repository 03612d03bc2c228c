//! QUIC transport
//!
//! One bidirectional stream per session over a quinn endpoint. Frames are
//! delimited by the u32 length prefix, reassembled with [`FrameDecoder`].
//! TLS is mandatory in QUIC; the relay binary supplies a certificate (or a
//! self-signed development one).

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};
use crate::TransportOptions;

use clasp_core::{frame, FrameDecoder};

/// ALPN protocol identifier for CLASP over QUIC
pub const CLASP_ALPN: &[u8] = b"clasp/3";

pub struct QuicSink {
    send: Arc<Mutex<SendStream>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for QuicSink {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let framed = frame::encode_frame(&payload);
        let mut send = self.send.lock().await;
        send.write_all(&framed)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let mut send = self.send.lock().await;
        let _ = send.finish();
        Ok(())
    }
}

pub struct QuicSource {
    rx: mpsc::Receiver<ConnEvent>,
}

#[async_trait]
impl FrameSource for QuicSource {
    async fn recv(&mut self) -> Option<ConnEvent> {
        self.rx.recv().await
    }
}

fn spawn_io(
    send: SendStream,
    recv: RecvStream,
    max_frame: usize,
) -> (Arc<dyn FrameSink>, BoxSource) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let open = Arc::new(AtomicBool::new(true));

    let open_r = open.clone();
    tokio::spawn(async move {
        let mut recv = recv;
        let mut decoder = FrameDecoder::new(max_frame);
        let mut chunk = vec![0u8; 16 * 1024];

        'io: loop {
            match recv.read(&mut chunk).await {
                Ok(Some(n)) => {
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
                                warn!("dropping quic stream on bad frame: {e}");
                                let _ =
                                    event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                                break 'io;
                            }
                        }
                    }
                }
                Ok(None) => {
                    let _ = event_tx.send(ConnEvent::Closed(None)).await;
                    break;
                }
                Err(e) => {
                    let _ = event_tx.send(ConnEvent::Closed(Some(e.to_string()))).await;
                    break;
                }
            }
        }
        open_r.store(false, Ordering::Release);
    });

    (
        Arc::new(QuicSink {
            send: Arc::new(Mutex::new(send)),
            open,
        }),
        Box::new(QuicSource { rx: event_rx }),
    )
}

/// QUIC listener. Requires a DER certificate chain and private key.
pub struct QuicListener {
    endpoint: Endpoint,
    options: TransportOptions,
}

impl QuicListener {
    pub fn bind(
        addr: SocketAddr,
        cert_der: Vec<u8>,
        key_der: Vec<u8>,
        options: TransportOptions,
    ) -> Result<Self> {
        let cert = rustls::pki_types::CertificateDer::from(cert_der);
        let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
            .map_err(|e| TransportError::BindFailed(format!("invalid private key: {e}")))?;

        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| TransportError::BindFailed(format!("tls config failed: {e}")))?;
        crypto.alpn_protocols = vec![CLASP_ALPN.to_vec()];

        let server_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| TransportError::BindFailed(format!("crypto config failed: {e}")))?;
        let server_config = ServerConfig::with_crypto(Arc::new(server_crypto));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        info!("quic listening on {addr}");

        Ok(Self { endpoint, options })
    }
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&mut self) -> Result<Accepted> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::Closed)?;
        let connection: Connection = incoming
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let peer = connection.remote_address();

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (sink, source) = spawn_io(send, recv, self.options.max_frame);
        Ok(Accepted { sink, source, peer })
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.close(0u32.into(), b"shutdown");
        Ok(())
    }
}

/// Connect to a CLASP QUIC endpoint, skipping certificate verification.
/// Development use; production clients should verify against real roots.
pub async fn connect_quic(
    addr: SocketAddr,
    server_name: &str,
    options: TransportOptions,
) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![CLASP_ALPN.to_vec()];

    let client_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::ConnectionFailed(format!("crypto config failed: {e}")))?;
    let client_config = ClientConfig::new(Arc::new(client_crypto));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    endpoint.set_default_client_config(client_config);

    let connection = endpoint
        .connect(addr, server_name)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    Ok(spawn_io(send, recv, options.max_frame))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
