//! Router error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("router is draining")]
    Draining,

    #[error("dispatcher stopped")]
    DispatcherStopped,

    #[error("persistence init failed: {0}")]
    PersistenceInit(String),

    #[error("transport error: {0}")]
    Transport(#[from] clasp_transport::TransportError),

    #[error("core protocol error: {0}")]
    Core(#[from] clasp_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
