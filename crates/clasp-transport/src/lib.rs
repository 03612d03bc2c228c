//! CLASP Transport Layer
//!
//! Byte-duplex transports for the router core and its clients. Every
//! transport exchanges the wire frames of `clasp_core::frame`; the traits
//! here hand whole payloads (prefix validated and stripped) to the layer
//! above, so the router performs no per-transport interpretation.
//!
//! Available transports:
//! - WebSocket (mandatory baseline, RFC 6455 binary messages)
//! - TCP (length-prefix delimited)
//! - UDP (one datagram per frame, session keyed by source tuple)
//! - QUIC (one bidirectional stream per session)
//! - In-memory (tests, embedded bridges)

pub mod error;
pub mod mem;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "quic")]
pub mod quic;

pub use error::{Result, TransportError};
pub use mem::{mem_pair, MemDialer, MemListener};
pub use traits::{Accepted, BoxSource, ConnEvent, FrameSink, FrameSource, Listener};

#[cfg(feature = "websocket")]
pub use websocket::{connect_ws, WsListener};

#[cfg(feature = "tcp")]
pub use tcp::{connect_tcp, TcpFrameListener};

#[cfg(feature = "udp")]
pub use udp::{connect_udp, UdpListener};

#[cfg(feature = "quic")]
pub use quic::{connect_quic, QuicListener};

/// Per-connection transport options
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Maximum accepted frame size, prefix included
    pub max_frame: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_frame: clasp_core::DEFAULT_MAX_FRAME,
        }
    }
}
