//! Router configuration

use clasp_core::{DEFAULT_MAX_FRAME, DEFAULT_QUIC_PORT, DEFAULT_WS_PORT};
use serde::{Deserialize, Serialize};

/// What happens when the state store is full and a new address is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Evict the least-recently-accessed entry
    #[default]
    Lru,
    /// Evict the entry with the earliest creation time
    Oldest,
    /// Reject the new write with AtCapacity
    RejectNew,
}

/// Handshake authorization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Any HELLO is admitted with unrestricted scopes
    #[default]
    Open,
    /// HELLO must carry a token the authorizer accepts
    TokenRequired,
}

/// Router configuration. Every option has an enumerated effect; defaults
/// match the protocol documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Server name reported in logs and discovery
    pub name: String,
    /// Bind host for all listeners
    pub host: String,
    /// WebSocket port
    pub ws_port: u16,
    /// QUIC port, if the QUIC listener is enabled
    pub quic_port: Option<u16>,
    /// Features advertised and granted in WELCOME
    pub features: Vec<String>,

    /// Maximum concurrent sessions; further connections are refused
    pub max_sessions: usize,
    /// Idle seconds before the router pings; two unanswered pings close
    pub session_timeout_secs: u64,
    /// Seconds a connection may sit without a HELLO
    pub handshake_timeout_secs: u64,

    /// Param TTL in seconds; entries idle longer are evicted
    pub param_ttl_secs: u64,
    /// TTL for timeline params (stored signals)
    pub signal_ttl_secs: u64,
    /// Disable TTL eviction entirely
    pub no_ttl: bool,
    /// Seconds between TTL sweeps
    pub ttl_sweep_secs: u64,
    /// Maximum live params; 0 means unbounded
    pub max_params: usize,
    /// Behavior when max_params is reached on a new address
    pub eviction: EvictionStrategy,

    /// Handshake authorization mode
    pub auth: AuthMode,

    /// Where the relay persists accepted writes (JSON lines); None
    /// disables persistence unless a hook is installed programmatically
    pub persist_path: Option<String>,
    /// Journal file; falls back to persist_path when unset
    pub journal_path: Option<String>,
    /// Seconds between persistence flushes
    pub persist_interval_secs: u64,
    /// When true, an open persistence circuit breaker degrades SET to
    /// Unavailable
    pub persist_required: bool,

    /// Seconds to flush outboxes on shutdown before closing sessions
    pub drain_timeout_secs: u64,
    /// Maximum wire frame size, prefix included
    pub frame_max_bytes: usize,

    /// Outbound queue entries per session before a consumer counts as slow
    pub outbox_capacity: usize,
    /// Queue depth where droppable-class coalescing starts
    pub outbox_low_water: usize,
    /// Seconds a full outbox is tolerated before SlowConsumer closes it
    pub slow_consumer_timeout_secs: u64,

    /// Reject bundles scheduled further ahead than this
    pub schedule_horizon_secs: u64,
    /// Gesture move-coalescing interval in milliseconds; 0 disables
    pub gesture_coalesce_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "CLASP Router".to_string(),
            host: "0.0.0.0".to_string(),
            ws_port: DEFAULT_WS_PORT,
            quic_port: Some(DEFAULT_QUIC_PORT),
            features: vec![
                "param".to_string(),
                "event".to_string(),
                "stream".to_string(),
                "gesture".to_string(),
                "timeline".to_string(),
            ],
            max_sessions: 1024,
            session_timeout_secs: 30,
            handshake_timeout_secs: 10,
            param_ttl_secs: 3600,
            signal_ttl_secs: 3600,
            no_ttl: false,
            ttl_sweep_secs: 60,
            max_params: 100_000,
            eviction: EvictionStrategy::default(),
            auth: AuthMode::default(),
            persist_path: None,
            journal_path: None,
            persist_interval_secs: 5,
            persist_required: false,
            drain_timeout_secs: 5,
            frame_max_bytes: DEFAULT_MAX_FRAME,
            outbox_capacity: 1024,
            outbox_low_water: 256,
            slow_consumer_timeout_secs: 5,
            schedule_horizon_secs: 24 * 3600,
            gesture_coalesce_ms: 16,
        }
    }
}

impl RouterConfig {
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.outbox_low_water >= self.outbox_capacity {
            return Err(crate::RouterError::Config(
                "outbox_low_water must be below outbox_capacity".to_string(),
            ));
        }
        if self.frame_max_bytes < 64 {
            return Err(crate::RouterError::Config(
                "frame_max_bytes too small".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder over [`RouterConfig`]
#[derive(Debug, Default)]
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn ws_port(mut self, port: u16) -> Self {
        self.config.ws_port = port;
        self
    }

    pub fn quic_port(mut self, port: Option<u16>) -> Self {
        self.config.quic_port = port;
        self
    }

    pub fn max_sessions(mut self, n: usize) -> Self {
        self.config.max_sessions = n;
        self
    }

    pub fn max_params(mut self, n: usize) -> Self {
        self.config.max_params = n;
        self
    }

    pub fn eviction(mut self, strategy: EvictionStrategy) -> Self {
        self.config.eviction = strategy;
        self
    }

    pub fn auth(mut self, mode: AuthMode) -> Self {
        self.config.auth = mode;
        self
    }

    pub fn no_ttl(mut self) -> Self {
        self.config.no_ttl = true;
        self
    }

    pub fn param_ttl_secs(mut self, secs: u64) -> Self {
        self.config.param_ttl_secs = secs;
        self
    }

    pub fn build(self) -> RouterConfig {
        self.config
    }
}
