//! Protocol message definitions
//!
//! Every wire payload is a MessagePack map carrying at least a `type` key;
//! the serde `tag = "type"` attribute on [`Message`] produces exactly that
//! shape. Unknown optional keys are ignored on decode; a missing mandatory
//! key or unknown `type` rejects the frame.

use crate::error::ErrorKind;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// Best effort, no ACK
    #[default]
    Fire = 0,
    /// ACK required on acceptance
    Confirm = 1,
    /// ACK required; bundles are durably accepted before the ACK
    Commit = 2,
}

impl QoS {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(QoS::Fire),
            1 => Some(QoS::Confirm),
            2 => Some(QoS::Commit),
            _ => None,
        }
    }
}

/// Signal kinds routed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Stateful parameter with revision tracking (written via SET)
    Param,
    /// Ephemeral trigger event
    Event,
    /// High-rate continuous data, coalescible
    Stream,
    /// Phased input (touch/pen/motion) with an id
    Gesture,
    /// Keyframe automation, stored but never interpolated by the router
    Timeline,
}

impl SignalKind {
    pub fn default_qos(&self) -> QoS {
        match self {
            SignalKind::Param | SignalKind::Event => QoS::Confirm,
            SignalKind::Stream | SignalKind::Gesture => QoS::Fire,
            SignalKind::Timeline => QoS::Commit,
        }
    }
}

/// Conflict resolution strategies for params
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Last write wins
    #[default]
    Lww,
    /// Accept only strictly greater numeric values
    Max,
    /// Accept only strictly less numeric values
    Min,
    /// Only the lock holder may write
    Lock,
    /// Accept and propagate; merging is the application's concern
    Merge,
}

/// Gesture phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GesturePhase {
    Start,
    Move,
    End,
    Cancel,
}

/// Easing applied between a keyframe and its successor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    Step,
}

/// A timeline keyframe. `time` is the offset in microseconds from timeline
/// start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub time: u64,
    pub value: Value,
    #[serde(default)]
    pub easing: Easing,
}

/// Optional parameter descriptor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Protocol message enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "HELLO")]
    Hello(Hello),

    #[serde(rename = "WELCOME")]
    Welcome(Welcome),

    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "PONG")]
    Pong,

    #[serde(rename = "SET")]
    Set(Set),

    #[serde(rename = "GET")]
    Get(Get),

    #[serde(rename = "VALUE")]
    Value(ParamSnapshot),

    #[serde(rename = "SUBSCRIBE")]
    Subscribe(Subscribe),

    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe(Unsubscribe),

    #[serde(rename = "PUBLISH")]
    Publish(Publish),

    #[serde(rename = "BUNDLE")]
    Bundle(Bundle),

    #[serde(rename = "ACK")]
    Ack(Ack),

    #[serde(rename = "ERROR")]
    Error(ErrorInfo),

    #[serde(rename = "SNAPSHOT")]
    Snapshot(Snapshot),

    #[serde(rename = "SYNC")]
    Sync(Sync),

    #[serde(rename = "ANNOUNCE")]
    Announce(Announce),

    #[serde(rename = "QUERY")]
    Query(Query),

    #[serde(rename = "RESULT")]
    Result(QueryResult),
}

/// HELLO - connection initiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// WELCOME - handshake accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub session: String,
    pub server_time: u64,
    #[serde(default)]
    pub features_granted: Vec<String>,
}

/// SET - param write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Set {
    pub address: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    /// Revision precondition; mismatch rejects the write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlock: bool,
    /// Conflict strategy, honored on the creating write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ParamMeta>,
}

impl Set {
    pub fn new(address: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            address: address.into(),
            value: value.into(),
            qos: None,
            revision: None,
            lock: false,
            unlock: false,
            strategy: None,
            meta: None,
        }
    }

    pub fn qos(&self) -> QoS {
        self.qos
            .and_then(QoS::from_u8)
            .unwrap_or(QoS::Confirm)
    }
}

/// GET - request current param state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Get {
    pub address: String,
}

/// One param as seen at a point in time. Used both as the VALUE reply and
/// as a SNAPSHOT entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSnapshot {
    pub address: String,
    pub value: Value,
    pub revision: u64,
    pub writer: String,
    pub timestamp: u64,
}

/// SUBSCRIBE - register a pattern subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub id: u32,
    pub pattern: String,
    /// Maximum deliveries per second; excess is coalesced, latest wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate: Option<u32>,
    /// Minimum |delta| between delivered numeric values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
}

/// UNSUBSCRIBE - also cancels a scheduled bundle with the same id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub id: u32,
}

/// PUBLISH - event / stream / gesture / timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    pub address: String,
    pub signal: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    // Gestures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<GesturePhase>,
    // Timelines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyframes: Option<Vec<Keyframe>>,
    #[serde(rename = "loop", default, skip_serializing_if = "is_false")]
    pub loop_: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
}

impl Publish {
    pub fn qos(&self) -> QoS {
        self.qos
            .and_then(QoS::from_u8)
            .unwrap_or_else(|| self.signal.default_qos())
    }
}

/// BUNDLE - atomic group of SET/PUBLISH, optionally scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Cancellation handle for scheduled bundles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Server time (µs); absent or past means execute immediately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    pub messages: Vec<Message>,
}

impl Bundle {
    pub fn qos(&self) -> QoS {
        self.qos.and_then(QoS::from_u8).unwrap_or(QoS::Commit)
    }
}

/// ACK - write or bundle accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<u32>,
}

/// ERROR - delivered to the offending session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, address: Option<String>) -> Self {
        Self {
            code: kind.code(),
            message: kind.to_string(),
            address,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>, address: Option<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            address,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.code)
    }
}

/// SNAPSHOT - bulk state for a new subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub params: Vec<ParamSnapshot>,
}

/// SYNC - NTP-style clock exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sync {
    pub t1: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t3: Option<u64>,
}

/// ANNOUNCE - signal advertisement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    pub signals: Vec<SignalInfo>,
}

/// One advertised signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub address: String,
    pub signal: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// QUERY - introspect announced signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub pattern: String,
}

/// RESULT - query response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub signals: Vec<SignalInfo>,
}

impl Message {
    /// Wire name, for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::Welcome(_) => "WELCOME",
            Message::Ping => "PING",
            Message::Pong => "PONG",
            Message::Set(_) => "SET",
            Message::Get(_) => "GET",
            Message::Value(_) => "VALUE",
            Message::Subscribe(_) => "SUBSCRIBE",
            Message::Unsubscribe(_) => "UNSUBSCRIBE",
            Message::Publish(_) => "PUBLISH",
            Message::Bundle(_) => "BUNDLE",
            Message::Ack(_) => "ACK",
            Message::Error(_) => "ERROR",
            Message::Snapshot(_) => "SNAPSHOT",
            Message::Sync(_) => "SYNC",
            Message::Announce(_) => "ANNOUNCE",
            Message::Query(_) => "QUERY",
            Message::Result(_) => "RESULT",
        }
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_default_qos_is_confirm() {
        let set = Set::new("/a", 1i64);
        assert_eq!(set.qos(), QoS::Confirm);
    }

    #[test]
    fn publish_qos_follows_signal() {
        let mut p = Publish {
            address: "/s".into(),
            signal: SignalKind::Stream,
            payload: Some(Value::Float(0.5)),
            qos: None,
            timestamp: None,
            gesture_id: None,
            phase: None,
            keyframes: None,
            loop_: false,
            start_time: None,
        };
        assert_eq!(p.qos(), QoS::Fire);
        p.signal = SignalKind::Timeline;
        assert_eq!(p.qos(), QoS::Commit);
        p.qos = Some(1);
        assert_eq!(p.qos(), QoS::Confirm);
    }

    #[test]
    fn qos_ordering() {
        assert!(QoS::Confirm >= QoS::Confirm);
        assert!(QoS::Commit > QoS::Fire);
        assert_eq!(QoS::from_u8(3), None);
    }
}
