//! External collaborator seams
//!
//! The core consumes three capability sets it does not implement:
//! authorization ([`Authorizer`]), durable state ([`Persistence`], fed
//! through a bounded queue with a circuit breaker), and protocol bridges
//! ([`BridgeAdapter`], which attach through the in-memory transport like
//! any other client).

use async_trait::async_trait;
use clasp_core::{ErrorKind, Pattern, Timestamp, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use clasp_transport::MemDialer;

/// Actions a scope can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// SUBSCRIBE, GET, QUERY
    Read,
    /// SET, PUBLISH, BUNDLE, ANNOUNCE
    Write,
    /// Everything
    Admin,
}

impl Action {
    pub fn allows(&self, other: Action) -> bool {
        match self {
            Action::Admin => true,
            Action::Write => matches!(other, Action::Write | Action::Read),
            Action::Read => matches!(other, Action::Read),
        }
    }
}

impl FromStr for Action {
    type Err = clasp_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" | "r" => Ok(Action::Read),
            "write" | "w" => Ok(Action::Write),
            "admin" | "a" | "*" => Ok(Action::Admin),
            other => Err(clasp_core::Error::InvalidPattern(format!(
                "unknown scope action: {other}"
            ))),
        }
    }
}

/// `action:pattern`, e.g. `write:/lights/**`
#[derive(Debug, Clone)]
pub struct Scope {
    action: Action,
    pattern: Pattern,
}

impl Scope {
    pub fn new(action: Action, pattern: Pattern) -> Self {
        Self { action, pattern }
    }

    pub fn parse(s: &str) -> Result<Self, clasp_core::Error> {
        let (action, pattern) = s.split_once(':').ok_or_else(|| {
            clasp_core::Error::InvalidPattern(format!("scope must be 'action:pattern': {s}"))
        })?;
        Ok(Self {
            action: action.parse()?,
            pattern: Pattern::parse(pattern)?,
        })
    }

    pub fn allows(&self, action: Action, address: &str) -> bool {
        self.action.allows(action) && self.pattern.matches(address)
    }
}

/// The scopes a session was granted at HELLO time
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
    unrestricted: bool,
}

impl ScopeSet {
    pub fn unrestricted() -> Self {
        Self {
            scopes: Vec::new(),
            unrestricted: true,
        }
    }

    pub fn from_scopes(scopes: Vec<Scope>) -> Self {
        Self {
            scopes,
            unrestricted: false,
        }
    }

    pub fn parse_all(raw: &[String]) -> Result<Self, clasp_core::Error> {
        let scopes = raw
            .iter()
            .map(|s| Scope::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_scopes(scopes))
    }

    pub fn allows(&self, action: Action, address: &str) -> bool {
        self.unrestricted || self.scopes.iter().any(|s| s.allows(action, address))
    }
}

/// Authorization hook consulted at HELLO, on every write, and on every
/// subscribe.
pub trait Authorizer: Send + Sync {
    /// Admit or reject a handshake; on success returns the session scopes.
    fn on_hello(&self, token: Option<&str>) -> Result<ScopeSet, ErrorKind>;

    fn check_write(&self, scopes: &ScopeSet, address: &str, value: &Value) -> bool {
        let _ = value;
        scopes.allows(Action::Write, address)
    }

    fn check_subscribe(&self, scopes: &ScopeSet, pattern: &Pattern) -> bool {
        scopes.allows(Action::Read, pattern.as_str())
    }
}

/// Admits every HELLO with unrestricted scopes.
pub struct OpenAuthorizer;

impl Authorizer for OpenAuthorizer {
    fn on_hello(&self, _token: Option<&str>) -> Result<ScopeSet, ErrorKind> {
        Ok(ScopeSet::unrestricted())
    }
}

/// Token-table authorizer: a static map from token to scope strings.
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, ScopeSet>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: HashMap<String, Vec<String>>) -> Result<Self, clasp_core::Error> {
        let mut parsed = HashMap::with_capacity(tokens.len());
        for (token, scopes) in tokens {
            parsed.insert(token, ScopeSet::parse_all(&scopes)?);
        }
        Ok(Self { tokens: parsed })
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn on_hello(&self, token: Option<&str>) -> Result<ScopeSet, ErrorKind> {
        let token = token.ok_or(ErrorKind::PermissionDenied)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(ErrorKind::PermissionDenied)
    }
}

/// One accepted param write, as handed to the persistence layer
#[derive(Debug, Clone)]
pub struct ParamRecord {
    pub address: String,
    pub value: Value,
    pub revision: u64,
    pub writer: String,
    pub timestamp: Timestamp,
}

/// Durable state hook. Record failures must not block the dispatcher; the
/// worker behind the queue absorbs latency and failure.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn record(&self, record: ParamRecord) -> Result<(), PersistError>;

    /// Called once during drain so the layer can flush buffers.
    async fn flush(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

pub type PersistError = Box<dyn std::error::Error + Send + Sync>;

const PERSIST_QUEUE_DEPTH: usize = 4096;

/// Dispatcher-side handle to the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Option<mpsc::Sender<ParamRecord>>,
    breaker_open: Arc<AtomicBool>,
    required: bool,
}

impl PersistenceHandle {
    /// No persistence configured: every record is accepted and discarded.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            breaker_open: Arc::new(AtomicBool::new(false)),
            required: false,
        }
    }

    /// Spawn the worker consuming the bounded queue. The layer's `flush`
    /// runs every `flush_interval_secs` and once more when the queue
    /// closes at drain.
    pub fn spawn(
        persistence: Arc<dyn Persistence>,
        required: bool,
        flush_interval_secs: u64,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ParamRecord>(PERSIST_QUEUE_DEPTH);
        let breaker_open = Arc::new(AtomicBool::new(false));

        let breaker = breaker_open.clone();
        tokio::spawn(async move {
            let mut flush_tick =
                tokio::time::interval(std::time::Duration::from_secs(flush_interval_secs.max(1)));
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    record = rx.recv() => {
                        let Some(record) = record else { break };
                        match persistence.record(record).await {
                            Ok(()) => {
                                if breaker.swap(false, Ordering::AcqRel) {
                                    debug!("persistence circuit breaker closed");
                                }
                            }
                            Err(e) => {
                                warn!("persistence record failed: {e}");
                                breaker.store(true, Ordering::Release);
                            }
                        }
                    }
                    _ = flush_tick.tick() => {
                        if let Err(e) = persistence.flush().await {
                            warn!("persistence flush failed: {e}");
                        }
                    }
                }
            }
            let _ = persistence.flush().await;
        });

        Self {
            tx: Some(tx),
            breaker_open,
            required,
        }
    }

    /// Fire-and-forget enqueue. Returns false when the record could not be
    /// accepted (queue full or breaker open); the caller logs and moves on.
    pub fn enqueue(&self, record: ParamRecord) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(e) => {
                warn!("persistence queue rejected record: {e}");
                self.breaker_open.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Whether writes may proceed. Only false when persistence is required
    /// and the circuit breaker is open.
    pub fn available(&self) -> bool {
        !(self.required && self.breaker_open.load(Ordering::Acquire))
    }

    pub fn configured(&self) -> bool {
        self.tx.is_some()
    }
}

/// The boundary shape a protocol bridge presents to the core. A bridge
/// attaches through the in-memory transport and speaks the ordinary wire
/// protocol; the router gives it nothing else.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Run the bridge against a router-local dialer until it exits.
    async fn run(self: Arc<Self>, dialer: MemDialer) -> Result<(), PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parse_and_allow() {
        let scope = Scope::parse("write:/lights/**").unwrap();
        assert!(scope.allows(Action::Write, "/lights/room1/brightness"));
        assert!(scope.allows(Action::Read, "/lights/room1/brightness"));
        assert!(!scope.allows(Action::Write, "/audio/gain"));
        assert!(Scope::parse("bogus").is_err());
        assert!(Scope::parse("launch:/a").is_err());
    }

    #[test]
    fn read_scope_does_not_grant_write() {
        let scopes = ScopeSet::parse_all(&["read:/**".to_string()]).unwrap();
        assert!(scopes.allows(Action::Read, "/a"));
        assert!(!scopes.allows(Action::Write, "/a"));
    }

    #[test]
    fn static_token_authorizer() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "cpsk_demo".to_string(),
            vec!["write:/stage/**".to_string(), "read:/**".to_string()],
        );
        let auth = StaticTokenAuthorizer::new(tokens).unwrap();

        assert!(auth.on_hello(None).is_err());
        assert!(auth.on_hello(Some("wrong")).is_err());
        let scopes = auth.on_hello(Some("cpsk_demo")).unwrap();
        assert!(auth.check_write(&scopes, "/stage/left", &Value::Null));
        assert!(!auth.check_write(&scopes, "/house/lights", &Value::Null));
    }

    #[tokio::test]
    async fn persistence_breaker_opens_on_failure() {
        struct Failing;
        #[async_trait]
        impl Persistence for Failing {
            async fn record(&self, _r: ParamRecord) -> Result<(), PersistError> {
                Err("disk gone".into())
            }
        }

        let handle = PersistenceHandle::spawn(Arc::new(Failing), true, 5);
        assert!(handle.available());
        handle.enqueue(ParamRecord {
            address: "/a".into(),
            value: Value::Int(1),
            revision: 1,
            writer: "s".into(),
            timestamp: 0,
        });
        // Give the worker a turn to fail
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.available());
    }

    #[test]
    fn disabled_handle_always_available() {
        let handle = PersistenceHandle::disabled();
        assert!(handle.available());
        assert!(handle.enqueue(ParamRecord {
            address: "/a".into(),
            value: Value::Int(1),
            revision: 1,
            writer: "s".into(),
            timestamp: 0,
        }));
    }
}
