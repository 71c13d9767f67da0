// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::core::frame::SocketId;
use thiserror::Error;

/// The main error enum, representing all possible failures within the tunnel.
///
/// Per-socket failures (`ConnectFailed`, `SendTimeout`, `ReceiveTimeout`) are
/// contained by removing the offending socket; failures of the shared
/// transport or of the map bookkeeping terminate the session.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("send timed out")]
    SendTimeout,

    #[error("receive timed out")]
    ReceiveTimeout,

    #[error("malformed frame: {0} bytes is shorter than the id suffix")]
    MalformedFrame(usize),

    #[error("no socket registered for id {0}")]
    NoSuchSocket(SocketId),

    #[error("socket id {0} is already registered")]
    DuplicateSocket(SocketId),

    #[error("a snapshot of the socket map is already outstanding")]
    ConcurrentSnapshot,

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("operation cancelled")]
    Cancelled,
}
