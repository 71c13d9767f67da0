// src/connection/registry.rs

//! The authoritative map of live sockets and its snapshot protocol.
//!
//! The supervisor pumping bytes out of the sockets needs a stable view of
//! the membership without holding the map locked across long I/O waits. It
//! takes a [`SocketSnapshot`]: an immutable copy of the entries paired with
//! a [`Lifetime`] that terminates the moment the membership changes, which
//! tells the supervisor to re-snapshot. At most one snapshot is outstanding
//! at a time; a snapshot detaches itself from the map when dropped.

use crate::connection::socket::SocketContext;
use crate::core::errors::TunnelError;
use crate::core::frame::SocketId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A one-shot signal: created alive, transitions to terminated exactly once,
/// observable by any number of waiters.
#[derive(Debug, Clone)]
pub struct Lifetime {
    token: CancellationToken,
}

impl Lifetime {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Transitions alive -> terminated. Idempotent.
    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the lifetime is terminated.
    pub async fn terminated(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug)]
struct MapInner {
    sockets: HashMap<SocketId, Arc<SocketContext>>,
    /// The outstanding snapshot, tagged with the epoch it was taken at.
    snapshot: Option<(u64, Lifetime)>,
    /// Monotonic counter distinguishing snapshot generations, so a stale
    /// snapshot dropping late can never clear its successor's slot.
    epoch: u64,
}

impl MapInner {
    fn invalidate_snapshot(&mut self) {
        if let Some((_, lifetime)) = self.snapshot.take() {
            lifetime.terminate();
        }
    }
}

/// Maps `SocketId -> SocketContext` for one session. Every public operation
/// runs inside a single mutex; nothing awaits while holding it.
#[derive(Debug)]
pub struct SocketMap {
    inner: Mutex<MapInner>,
}

impl Default for SocketMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MapInner {
                sockets: HashMap::new(),
                snapshot: None,
                epoch: 0,
            }),
        }
    }

    /// Registers a context under its id. Fails with
    /// [`TunnelError::DuplicateSocket`] if the id is already present; the
    /// caller keeps ownership of the rejected context.
    pub fn add_socket(&self, context: Arc<SocketContext>) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock().expect("socket map lock poisoned");
        let id = context.id();
        if inner.sockets.contains_key(&id) {
            return Err(TunnelError::DuplicateSocket(id));
        }
        inner.sockets.insert(id, context);
        inner.invalidate_snapshot();
        Ok(())
    }

    /// Looks up the context for `id`, if present.
    pub fn get_socket(&self, id: SocketId) -> Option<Arc<SocketContext>> {
        let inner = self.inner.lock().expect("socket map lock poisoned");
        inner.sockets.get(&id).cloned()
    }

    /// Looks up the context for `id`, failing with
    /// [`TunnelError::NoSuchSocket`] when absent.
    pub fn require_socket(&self, id: SocketId) -> Result<Arc<SocketContext>, TunnelError> {
        self.get_socket(id).ok_or(TunnelError::NoSuchSocket(id))
    }

    /// Removes and disposes the context for `id`. Returns whether an entry
    /// was present.
    pub fn remove_socket(&self, id: SocketId) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("socket map lock poisoned");
            let removed = inner.sockets.remove(&id);
            if removed.is_some() {
                inner.invalidate_snapshot();
            }
            removed
        };
        match removed {
            Some(context) => {
                debug!("socket {} removed from map", id);
                context.dispose();
                true
            }
            None => false,
        }
    }

    /// Disposes every context and clears the map.
    pub fn reset(&self) {
        let drained: Vec<Arc<SocketContext>> = {
            let mut inner = self.inner.lock().expect("socket map lock poisoned");
            inner.invalidate_snapshot();
            inner.sockets.drain().map(|(_, ctx)| ctx).collect()
        };
        for context in drained {
            context.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("socket map lock poisoned").sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes an immutable view of the current membership plus its lifetime.
    ///
    /// Fails with [`TunnelError::ConcurrentSnapshot`] when one is already
    /// outstanding; the previous snapshot must be dropped (or invalidated by
    /// a mutation) first.
    pub fn snapshot(&self) -> Result<SocketSnapshot<'_>, TunnelError> {
        let mut inner = self.inner.lock().expect("socket map lock poisoned");
        if inner.snapshot.is_some() {
            return Err(TunnelError::ConcurrentSnapshot);
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        let epoch = inner.epoch;
        let lifetime = Lifetime::new();
        inner.snapshot = Some((epoch, lifetime.clone()));
        let entries: Vec<(SocketId, Arc<SocketContext>)> = inner
            .sockets
            .iter()
            .map(|(id, ctx)| (*id, Arc::clone(ctx)))
            .collect();
        Ok(SocketSnapshot {
            entries,
            lifetime,
            epoch,
            map: self,
        })
    }

    /// Cooperative release: clears the outstanding-snapshot slot if the
    /// given generation is still the recorded one.
    fn detach(&self, epoch: u64) {
        let mut inner = self.inner.lock().expect("socket map lock poisoned");
        if inner
            .snapshot
            .as_ref()
            .is_some_and(|(current, _)| *current == epoch)
        {
            inner.snapshot = None;
        }
    }
}

/// An immutable point-in-time view of the map, paired with the [`Lifetime`]
/// that terminates on the next membership change. Detaches from the map on
/// drop.
#[derive(Debug)]
pub struct SocketSnapshot<'a> {
    entries: Vec<(SocketId, Arc<SocketContext>)>,
    lifetime: Lifetime,
    epoch: u64,
    map: &'a SocketMap,
}

impl SocketSnapshot<'_> {
    pub fn entries(&self) -> &[(SocketId, Arc<SocketContext>)] {
        &self.entries
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.entries.iter().any(|(entry_id, _)| *entry_id == id)
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for SocketSnapshot<'_> {
    fn drop(&mut self) {
        self.map.detach(self.epoch);
    }
}
