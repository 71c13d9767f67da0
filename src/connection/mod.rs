// src/connection/mod.rs

//! Manages the lifecycle of the multiplexed TCP sockets: the per-socket
//! context, the authoritative socket map with its snapshot protocol, and the
//! server-side auto-connect variant.

// Declare the private sub-modules of the `connection` module.
mod autoconnect;
mod registry;
mod socket;

// Publicly re-export the primary types from the sub-modules.
pub use autoconnect::AutoConnectMap;
pub use registry::{Lifetime, SocketMap, SocketSnapshot};
pub use socket::SocketContext;
