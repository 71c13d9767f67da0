// src/core/mod.rs

//! The central module containing the multiplexing engine of burrow.

pub mod errors;
pub mod frame;
pub mod multiplexer;
pub mod timeouts;
pub mod transport;

pub use errors::TunnelError;
pub use frame::SocketId;
