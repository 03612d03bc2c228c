//! The router: transport accept loops and session lifecycle
//!
//! Accepts connections on any [`Listener`], runs the handshake, then pumps
//! decoded frames into the dispatcher. Each connection gets two tasks: the
//! reader below (which also owns liveness) and the session writer draining
//! the outbox. Teardown is deterministic: drain flushes outboxes under a
//! deadline, then every session closes with a shutdown reason and the
//! dispatcher and scheduler stop.

use clasp_core::{
    codec, Clock, ErrorInfo, ErrorKind, Hello, Message, Welcome, PROTOCOL_VERSION,
};
use clasp_transport::{
    Accepted, BoxSource, ConnEvent, FrameSink, Listener, MemDialer, MemListener, TransportOptions,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{AuthMode, RouterConfig};
use crate::dispatch::{Cmd, Dispatcher};
use crate::error::Result;
use crate::hooks::{Authorizer, OpenAuthorizer, Persistence, PersistenceHandle};
use crate::schedule::{spawn_scheduler, SchedulerHandle};
use crate::session::{OutboundFrame, Session, SessionId};

const CMD_QUEUE_DEPTH: usize = 4096;

struct Inner {
    config: RouterConfig,
    clock: Clock,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    cmd_tx: mpsc::Sender<Cmd>,
    scheduler: SchedulerHandle,
    authorizer: Arc<dyn Authorizer>,
    draining: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    local_dialer: MemDialer,
    sub_count: Arc<AtomicUsize>,
    param_count: Arc<AtomicUsize>,
}

/// The CLASP router core
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// Build and start a router with open authorization and no persistence.
    pub fn new(config: RouterConfig) -> Result<Self> {
        Self::with_hooks(config, Arc::new(OpenAuthorizer), None)
    }

    /// Build and start a router with explicit collaborator hooks. The
    /// dispatcher, scheduler, TTL sweeper, and local accept loop all spawn
    /// here; accept loops for network transports are started by the
    /// `serve_*` methods.
    pub fn with_hooks(
        config: RouterConfig,
        authorizer: Arc<dyn Authorizer>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Result<Self> {
        config.validate()?;

        let clock = Clock::new();
        let sessions: Arc<DashMap<SessionId, Arc<Session>>> = Arc::new(DashMap::new());
        let draining = Arc::new(AtomicBool::new(false));
        let sub_count = Arc::new(AtomicUsize::new(0));
        let param_count = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, _) = watch::channel(false);

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
        let scheduler = spawn_scheduler(clock.clone(), cmd_tx.clone());

        let persistence_handle = match persistence {
            Some(p) => {
                PersistenceHandle::spawn(p, config.persist_required, config.persist_interval_secs)
            }
            None => PersistenceHandle::disabled(),
        };

        let dispatcher = Dispatcher::new(
            config.clone(),
            clock.clone(),
            sessions.clone(),
            scheduler.clone(),
            authorizer.clone(),
            persistence_handle,
            draining.clone(),
            sub_count.clone(),
            param_count.clone(),
        );
        tokio::spawn(dispatcher.run(cmd_rx));

        // TTL sweeper
        if !config.no_ttl {
            let sweep_tx = cmd_tx.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let period = Duration::from_secs(config.ttl_sweep_secs.max(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if sweep_tx.send(Cmd::SweepTtl).await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            });
        }

        let (local_listener, local_dialer) = MemListener::new();

        let router = Router {
            inner: Arc::new(Inner {
                config,
                clock,
                sessions,
                cmd_tx,
                scheduler,
                authorizer,
                draining,
                shutdown_tx,
                local_dialer,
                sub_count,
                param_count,
            }),
        };

        // In-process clients (tests, bridge adapters) attach through the
        // mem transport like any network peer
        let local = router.clone();
        tokio::spawn(async move {
            local.serve_listener(local_listener).await.ok();
        });

        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.sub_count.load(Ordering::Relaxed)
    }

    pub fn param_count(&self) -> usize {
        self.inner.param_count.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_frame: self.inner.config.frame_max_bytes,
        }
    }

    /// Serve WebSocket on the configured address. Blocks until shutdown.
    #[cfg(feature = "websocket")]
    pub async fn serve_ws(&self) -> Result<()> {
        let addr = self.inner.config.ws_addr();
        let listener =
            clasp_transport::WsListener::bind(&addr, self.transport_options()).await?;
        self.serve_listener(listener).await
    }

    #[cfg(feature = "websocket")]
    pub async fn serve_ws_addr(&self, addr: &str) -> Result<()> {
        let listener = clasp_transport::WsListener::bind(addr, self.transport_options()).await?;
        self.serve_listener(listener).await
    }

    #[cfg(feature = "tcp")]
    pub async fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener =
            clasp_transport::TcpFrameListener::bind(addr, self.transport_options()).await?;
        self.serve_listener(listener).await
    }

    #[cfg(feature = "udp")]
    pub async fn serve_udp(&self, addr: &str) -> Result<()> {
        let listener = clasp_transport::UdpListener::bind(addr, self.transport_options()).await?;
        self.serve_listener(listener).await
    }

    #[cfg(feature = "quic")]
    pub async fn serve_quic(
        &self,
        addr: std::net::SocketAddr,
        cert_der: Vec<u8>,
        key_der: Vec<u8>,
    ) -> Result<()> {
        let listener =
            clasp_transport::QuicListener::bind(addr, cert_der, key_der, self.transport_options())?;
        self.serve_listener(listener).await
    }

    /// Accept loop over any transport listener.
    pub async fn serve_listener(&self, mut listener: impl Listener) -> Result<()> {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok(accepted) => self.admit(accepted),
                        Err(clasp_transport::TransportError::Closed) => break,
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        listener.close().await.ok();
        Ok(())
    }

    /// Open an in-process connection to this router. The returned endpoint
    /// behaves exactly like a network client.
    pub async fn connect_local(
        &self,
    ) -> Result<(Arc<dyn FrameSink>, BoxSource)> {
        Ok(self.inner.local_dialer.connect().await?)
    }

    /// Dialer handle for bridge adapters.
    pub fn local_dialer(&self) -> MemDialer {
        self.inner.local_dialer.clone()
    }

    fn admit(&self, accepted: Accepted) {
        let inner = self.inner.clone();
        if inner.draining.load(Ordering::Acquire) {
            tokio::spawn(refuse(accepted.sink, ErrorKind::Unavailable, "draining"));
            return;
        }
        if inner.sessions.len() >= inner.config.max_sessions {
            debug!(peer = %accepted.peer, "refusing connection at session limit");
            tokio::spawn(refuse(
                accepted.sink,
                ErrorKind::Unavailable,
                "session limit reached",
            ));
            return;
        }
        tokio::spawn(async move {
            handle_connection(inner, accepted).await;
        });
    }

    /// Graceful drain: refuse new connections, answer writes with
    /// Unavailable, flush outboxes under the drain deadline, then close
    /// every session and stop the core tasks.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("router draining");
        let _ = inner.shutdown_tx.send(true);

        // Tell every session why it is going away
        let goodbye = Message::Error(ErrorInfo::with_message(
            ErrorKind::Unavailable,
            "router shutting down",
            None,
        ));
        if let Ok(bytes) = codec::encode_payload(&goodbye) {
            for entry in inner.sessions.iter() {
                entry
                    .value()
                    .enqueue(OutboundFrame::control(bytes::Bytes::from(bytes.clone())));
            }
        }

        // Drain outboxes (pending ACKs included) up to the deadline
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(inner.config.drain_timeout_secs);
        loop {
            let pending = inner
                .sessions
                .iter()
                .any(|entry| !entry.value().outbox().is_empty());
            if !pending || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Close all sessions through the dispatcher so cleanup is uniform
        let ids: Vec<SessionId> = inner.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            let _ = inner
                .cmd_tx
                .send(Cmd::SessionClosed { session_id })
                .await;
        }

        inner.scheduler.shutdown();
        let _ = inner.cmd_tx.send(Cmd::Stop).await;
        info!("router stopped");
    }
}

/// Send one ERROR frame straight to a sink and close it (pre-session).
async fn refuse(sink: Arc<dyn FrameSink>, kind: ErrorKind, detail: &str) {
    let msg = Message::Error(ErrorInfo::with_message(kind, detail, None));
    if let Ok(bytes) = codec::encode_payload(&msg) {
        let _ = sink.send(bytes::Bytes::from(bytes)).await;
    }
    let _ = sink.close().await;
}

async fn handle_connection(inner: Arc<Inner>, accepted: Accepted) {
    let Accepted {
        sink, mut source, peer,
    } = accepted;

    // Handshake: a HELLO must arrive within the deadline, before anything
    // else
    let handshake = tokio::time::timeout(
        Duration::from_secs(inner.config.handshake_timeout_secs),
        source.recv(),
    )
    .await;

    let hello = match handshake {
        Err(_) => {
            debug!(%peer, "handshake timeout");
            refuse(sink, ErrorKind::Timeout, "no HELLO before deadline").await;
            return;
        }
        Ok(Some(ConnEvent::Frame(payload))) => match codec::decode_payload(&payload) {
            Ok(Message::Hello(hello)) => hello,
            Ok(other) => {
                debug!(%peer, kind = other.type_name(), "expected HELLO");
                refuse(sink, ErrorKind::InvalidHandshake, "expected HELLO").await;
                return;
            }
            Err(e) => {
                debug!(%peer, "undecodable handshake frame: {e}");
                refuse(sink, ErrorKind::MalformedFrame, "undecodable frame").await;
                return;
            }
        },
        Ok(_) => return, // closed before HELLO
    };

    let session = match admit_session(&inner, hello, peer, sink.clone()) {
        Ok(session) => session,
        Err((kind, detail)) => {
            refuse(sink, kind, &detail).await;
            return;
        }
    };
    let writer = session.spawn_writer();

    info!(session = %session.id, name = %session.name, %peer, "session active");

    // Reader loop with liveness: any inbound frame proves the client is
    // alive; after an idle interval we ping, and a second silent interval
    // closes the session
    let idle = Duration::from_secs(inner.config.session_timeout_secs.max(1));
    let mut missed_pings: u32 = 0;
    let ping_bytes = codec::encode_payload(&Message::Ping).ok();

    loop {
        match tokio::time::timeout(idle, source.recv()).await {
            Err(_) => {
                missed_pings += 1;
                if missed_pings > 2 {
                    debug!(session = %session.id, "liveness timeout");
                    let bye = Message::Error(ErrorInfo::new(ErrorKind::Timeout, None));
                    if let Ok(bytes) = codec::encode_payload(&bye) {
                        session.enqueue(OutboundFrame::control(bytes::Bytes::from(bytes)));
                    }
                    break;
                }
                if let Some(bytes) = &ping_bytes {
                    session.enqueue(OutboundFrame::control(bytes::Bytes::from(bytes.clone())));
                }
            }
            Ok(Some(ConnEvent::Frame(payload))) => {
                missed_pings = 0;
                match codec::decode_payload(&payload) {
                    Ok(Message::Pong) => {}
                    Ok(message) => {
                        let cmd = Cmd::Inbound {
                            session_id: session.id.clone(),
                            message,
                        };
                        if inner.cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Codec rejection is fatal to the session
                        warn!(session = %session.id, "malformed frame: {e}");
                        let kind = e.kind();
                        let info = ErrorInfo::with_message(kind, e.to_string(), None);
                        if let Ok(bytes) = codec::encode_payload(&Message::Error(info)) {
                            session.enqueue(OutboundFrame::control(bytes::Bytes::from(bytes)));
                        }
                        break;
                    }
                }
            }
            Ok(Some(ConnEvent::Closed(reason))) => {
                debug!(session = %session.id, ?reason, "transport closed");
                break;
            }
            Ok(None) => break,
        }
    }

    let closed = inner
        .cmd_tx
        .send(Cmd::SessionClosed {
            session_id: session.id.clone(),
        })
        .await;
    if closed.is_err() {
        // Dispatcher already gone; release the writer ourselves
        session.outbox().close_discard();
    }
    // The dispatcher (or the close above) ends the outbox; the writer
    // drains and closes the sink
    let _ = writer.await;
}

fn admit_session(
    inner: &Arc<Inner>,
    hello: Hello,
    peer: std::net::SocketAddr,
    sink: Arc<dyn FrameSink>,
) -> std::result::Result<Arc<Session>, (ErrorKind, String)> {
    if inner.draining.load(Ordering::Acquire) {
        return Err((ErrorKind::Unavailable, "draining".to_string()));
    }
    if hello.version != PROTOCOL_VERSION {
        return Err((
            ErrorKind::VersionMismatch,
            format!(
                "protocol version {} unsupported; this router speaks {}",
                hello.version, PROTOCOL_VERSION
            ),
        ));
    }
    if inner.config.auth == AuthMode::TokenRequired && hello.token.is_none() {
        return Err((ErrorKind::PermissionDenied, "token required".to_string()));
    }
    let scopes = inner
        .authorizer
        .on_hello(hello.token.as_deref())
        .map_err(|kind| (kind, "handshake rejected".to_string()))?;
    if inner.sessions.len() >= inner.config.max_sessions {
        return Err((ErrorKind::Unavailable, "session limit reached".to_string()));
    }

    let granted: Vec<String> = if hello.features.is_empty() {
        inner.config.features.clone()
    } else {
        hello
            .features
            .iter()
            .filter(|f| inner.config.features.contains(f))
            .cloned()
            .collect()
    };

    let session = Arc::new(Session::new(
        hello.name,
        granted.clone(),
        peer,
        scopes,
        sink,
        inner.config.outbox_capacity,
        inner.config.outbox_low_water,
    ));
    inner.sessions.insert(session.id.clone(), session.clone());

    let welcome = Message::Welcome(Welcome {
        session: session.id.clone(),
        server_time: inner.clock.now(),
        features_granted: granted,
    });
    match codec::encode_payload(&welcome) {
        Ok(bytes) => {
            session.enqueue(OutboundFrame::control(bytes::Bytes::from(bytes)));
        }
        Err(e) => {
            inner.sessions.remove(&session.id);
            return Err((ErrorKind::Unavailable, format!("welcome encode failed: {e}")));
        }
    }

    Ok(session)
}
