//! CLASP Core
//!
//! Core types, encoding, and protocol primitives for CLASP v3.
//! Creative Low-Latency Application Streaming Protocol.
//!
//! This crate provides:
//! - Protocol message types ([`Message`], [`SignalKind`])
//! - Length-prefixed frame handling ([`frame`])
//! - MessagePack payload encoding ([`codec`])
//! - Address parsing and wildcard matching ([`Address`], [`Pattern`])
//! - The wire error taxonomy ([`ErrorKind`])
//! - Timing utilities ([`Clock`], [`ClockSync`])

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod time;
pub mod value;

pub use address::{Address, Pattern, PatternSegment};
pub use error::{Error, ErrorKind, Result};
pub use frame::FrameDecoder;
pub use message::{
    Ack, Announce, Bundle, ConflictStrategy, Easing, ErrorInfo, GesturePhase, Get, Hello,
    Keyframe, Message, ParamMeta, ParamSnapshot, Publish, QoS, Query, QueryResult, Set,
    SignalInfo, SignalKind, Snapshot, Subscribe, Sync, Unsubscribe, Welcome,
};
pub use time::{Clock, ClockSync, Timestamp};
pub use value::Value;

/// Protocol version. v3 replaced the magic-byte frame of v2 with the
/// length-prefixed MessagePack record implemented in [`frame`] and [`codec`].
pub const PROTOCOL_VERSION: u8 = 3;

/// Default WebSocket port
pub const DEFAULT_WS_PORT: u16 = 7330;

/// Default QUIC port (shared with UDP discovery)
pub const DEFAULT_QUIC_PORT: u16 = 7331;

/// WebSocket subprotocol identifier
pub const WS_SUBPROTOCOL: &str = "clasp.v3";

/// Default maximum frame size (64 MiB)
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;
