// src/core/frame.rs

//! Wire framing for the tunnel transport.
//!
//! Every transport message carries one chunk of socket data followed by the
//! identifier of the socket it belongs to:
//!
//! ```text
//! +---------------------+---------------+
//! | payload (N-8 bytes) | id (8 bytes)  |
//! +---------------------+---------------+
//! ```
//!
//! The id is a little-endian `u64` suffix so the payload can be read and
//! written in place without shifting. A zero-length payload is the orderly
//! close signal for that id. The layout is symmetric in both directions.

use crate::core::errors::TunnelError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Length of the trailing socket id, in bytes.
pub const ID_LEN: usize = 8;

/// Maximum size of one transport message, id suffix included.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - ID_LEN;

/// Identifier of one multiplexed TCP connection within a session.
///
/// Opaque: equality and hash identity only. Uniqueness is scoped to a single
/// multiplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl SocketId {
    /// Decodes an id from its little-endian wire form.
    pub fn from_le_bytes(bytes: [u8; ID_LEN]) -> Self {
        SocketId(u64::from_le_bytes(bytes))
    }

    /// Encodes the id into its little-endian wire form.
    pub fn to_le_bytes(self) -> [u8; ID_LEN] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Splits a transport message into its payload and trailing socket id.
///
/// Fails with [`TunnelError::MalformedFrame`] when the message is shorter
/// than the id suffix. A zero-length payload with a valid id is the orderly
/// close signal.
pub fn split(message: &[u8]) -> Result<(&[u8], SocketId), TunnelError> {
    let Some(payload_len) = message.len().checked_sub(ID_LEN) else {
        return Err(TunnelError::MalformedFrame(message.len()));
    };
    let (payload, id_bytes) = message.split_at(payload_len);
    let id = SocketId::from_le_bytes(id_bytes.try_into().expect("suffix is ID_LEN bytes"));
    Ok((payload, id))
}

/// Appends the id suffix after the payload already in `buf` and takes the
/// combined frame out, leaving `buf` empty for reuse.
pub fn join(buf: &mut BytesMut, id: SocketId) -> Bytes {
    buf.put_u64_le(id.0);
    buf.split().freeze()
}

/// Builds the orderly-close frame for `id`: an empty payload and the suffix.
pub fn close(id: SocketId) -> Bytes {
    Bytes::copy_from_slice(&id.to_le_bytes())
}
