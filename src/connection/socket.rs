// src/connection/socket.rs

//! Defines `SocketContext`, the wrapper around one multiplexed TCP socket.
//!
//! A context either starts from an already-accepted stream (listener side)
//! or connects lazily to its target on first use (server side). Each context
//! carries its own [`Timeouts`] scope: any send or receive failure trips the
//! scope's root, so the concurrent operation on the other half of the socket
//! fails fast instead of waiting out its own deadline.

use crate::core::errors::TunnelError;
use crate::core::frame::SocketId;
use crate::core::timeouts::Timeouts;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One multiplexed TCP socket with lazy connect and per-operation deadlines.
///
/// The connect transition is serialized by a mutex; after it, one send and
/// one receive may proceed concurrently on the split halves.
#[derive(Debug)]
pub struct SocketContext {
    id: SocketId,
    target: Option<String>,
    timeouts: Timeouts,
    connected: AtomicBool,
    connect_lock: Mutex<()>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
}

impl SocketContext {
    /// Wraps an already-connected stream (an accepted local client).
    pub fn connected(id: SocketId, stream: TcpStream, timeouts: Timeouts) -> Self {
        let (read, write) = stream.into_split();
        Self {
            id,
            target: None,
            timeouts,
            connected: AtomicBool::new(true),
            connect_lock: Mutex::new(()),
            read_half: Mutex::new(Some(read)),
            write_half: Mutex::new(Some(write)),
        }
    }

    /// Creates a context that connects to `target` on first send or receive.
    pub fn lazy(id: SocketId, target: String, timeouts: Timeouts) -> Self {
        Self {
            id,
            target: Some(target),
            timeouts,
            connected: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Establishes the connection if it is not up yet. At most one attempt
    /// runs at a time; losers of the race observe the winner's result.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(target) = self.target.as_deref() else {
            // A pre-connected context can only get here after its stream was
            // torn down; surface that as a failed connect.
            self.timeouts.cancel();
            return Err(TunnelError::ConnectFailed {
                addr: "<none>".to_string(),
                reason: "socket has no target and is not connected".to_string(),
            });
        };

        let result = self
            .timeouts
            .bound_connect(target, async {
                TcpStream::connect(target)
                    .await
                    .map_err(|e| TunnelError::ConnectFailed {
                        addr: target.to_string(),
                        reason: e.to_string(),
                    })
            })
            .await;

        match result {
            Ok(stream) => {
                let (read, write) = stream.into_split();
                *self.read_half.lock().await = Some(read);
                *self.write_half.lock().await = Some(write);
                self.connected.store(true, Ordering::Release);
                debug!("socket {} connected to {}", self.id, target);
                Ok(())
            }
            Err(e) => {
                warn!("socket {}: {}", self.id, e);
                self.timeouts.cancel();
                Err(e)
            }
        }
    }

    /// Writes one segment to the socket under the send deadline.
    ///
    /// An empty segment is the orderly-disconnect request: the write half is
    /// shut down and the call returns without error.
    pub async fn send(&self, segment: &[u8]) -> Result<(), TunnelError> {
        if segment.is_empty() {
            return self.disconnect().await;
        }
        self.connect().await?;

        let result = self
            .timeouts
            .bound_send(async {
                let mut guard = self.write_half.lock().await;
                let half = guard
                    .as_mut()
                    .ok_or_else(|| TunnelError::Io(std::io::ErrorKind::NotConnected.into()))?;
                half.write_all(segment).await.map_err(TunnelError::from)
            })
            .await;

        if let Err(e) = &result {
            warn!("socket {} send failed: {}", self.id, e);
            self.timeouts.cancel();
        }
        result
    }

    /// Reads up to `max` bytes into `buf` under the idle deadline, returning
    /// the number of bytes appended. `Ok(0)` is end-of-stream.
    pub async fn receive(&self, buf: &mut BytesMut, max: usize) -> Result<usize, TunnelError> {
        self.connect().await?;
        buf.reserve(max);

        let result = self
            .timeouts
            .bound_idle(async {
                let mut guard = self.read_half.lock().await;
                let half = guard
                    .as_mut()
                    .ok_or_else(|| TunnelError::Io(std::io::ErrorKind::NotConnected.into()))?;
                let mut dst = (&mut *buf).limit(max);
                half.read_buf(&mut dst).await.map_err(TunnelError::from)
            })
            .await;

        if let Err(e) = &result {
            warn!("socket {} receive failed: {}", self.id, e);
            self.timeouts.cancel();
        }
        result
    }

    /// Orderly TCP disconnect: flush and FIN the write half, no linger.
    /// Idempotent; the read half drains until the peer closes its side.
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        let mut guard = self.write_half.lock().await;
        if let Some(mut half) = guard.take() {
            debug!("socket {} orderly disconnect", self.id);
            half.shutdown().await.map_err(TunnelError::from)?;
        }
        Ok(())
    }

    /// Sleeps the configured linger delay, or returns early once this
    /// context is cancelled.
    pub async fn linger(&self) {
        self.timeouts.linger().await;
    }

    /// Fails every outstanding and future operation on this context. Called
    /// by the map when the socket is removed or the map is reset.
    pub fn dispose(&self) {
        self.timeouts.cancel();
    }
}
