//! Transport capability traits
//!
//! The acceptor side of the router is polymorphic over {listen, accept,
//! receive frames, send frames, close}. A connection handle is a pair of
//! [`FrameSink`] (shared, cloneable via `Arc`) and [`FrameSource`] (owned by
//! the session reader task).

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Result;

/// Events produced by a connection
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// One complete frame payload (length prefix validated and stripped)
    Frame(Bytes),
    /// Connection ended, with an optional reason
    Closed(Option<String>),
}

/// Sending half of a connection
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame payload; the transport adds the length prefix.
    async fn send(&self, payload: Bytes) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Receiving half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next event; `None` once the connection is fully drained.
    async fn recv(&mut self) -> Option<ConnEvent>;
}

pub type BoxSource = Box<dyn FrameSource>;

/// An accepted connection
pub struct Accepted {
    pub sink: Arc<dyn FrameSink>,
    pub source: BoxSource,
    pub peer: SocketAddr,
}

/// A bound transport listener
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Accepted>;

    fn local_addr(&self) -> Result<SocketAddr>;

    async fn close(&self) -> Result<()>;
}

pub type BoxListener = Box<dyn Listener>;
