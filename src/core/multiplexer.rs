// src/core/multiplexer.rs

//! The per-session engine relaying bytes between the transport and the
//! multiplexed sockets.
//!
//! Two pumps run concurrently until either finishes: the inbound pump moves
//! transport messages to their sockets, and the outbound supervisor keeps
//! one receive task alive per registered socket, re-snapshotting the map
//! whenever its membership changes. Any unrecoverable error on either pump
//! ends the session; the other pump and every per-socket task observe the
//! cancellation and unwind within the linger delay.

use crate::connection::{SocketContext, SocketMap};
use crate::core::errors::TunnelError;
use crate::core::frame::{self, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, SocketId};
use crate::core::timeouts::{TimeoutConfig, Timeouts};
use crate::core::transport::Transport;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long the supervisor waits for a departed socket's task to finish
/// before checking again on the next round.
const REAP_DEADLINE: Duration = Duration::from_millis(1);

/// Resolves the socket a transport frame belongs to.
///
/// The listener side requires the id to be registered already; the server
/// side connects to its upstream target on demand.
#[async_trait]
pub trait SocketResolver: Send + Sync {
    /// Resolves the socket for a data frame, creating one when the variant
    /// allows it. `cancel` bounds any connection attempt.
    async fn resolve(
        &self,
        id: SocketId,
        cancel: &CancellationToken,
    ) -> Result<Arc<SocketContext>, TunnelError>;

    /// Side-effect-free lookup, used for close frames.
    fn lookup(&self, id: SocketId) -> Option<Arc<SocketContext>>;

    /// The underlying socket map.
    fn registry(&self) -> &Arc<SocketMap>;
}

/// Listener-side resolution: sockets are registered by the accept loop, and
/// a frame for an unknown id means the tunnel peers disagree about the
/// session state.
pub struct RegisteredOnly {
    registry: Arc<SocketMap>,
}

impl RegisteredOnly {
    pub fn new(registry: Arc<SocketMap>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SocketResolver for RegisteredOnly {
    async fn resolve(
        &self,
        id: SocketId,
        _cancel: &CancellationToken,
    ) -> Result<Arc<SocketContext>, TunnelError> {
        self.registry.require_socket(id)
    }

    fn lookup(&self, id: SocketId) -> Option<Arc<SocketContext>> {
        self.registry.get_socket(id)
    }

    fn registry(&self) -> &Arc<SocketMap> {
        &self.registry
    }
}

/// Runs one multiplex session over a transport and a socket map.
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SocketResolver>,
    timeouts: Timeouts,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SocketResolver>,
        parent: &CancellationToken,
        config: TimeoutConfig,
    ) -> Self {
        Self {
            transport,
            resolver,
            timeouts: Timeouts::new(parent, config),
        }
    }

    /// Relays until either direction fails or the session is cancelled.
    ///
    /// On the way out the session scope is cancelled and the per-socket
    /// receive tasks are drained, aborting any that outlive the linger
    /// delay.
    pub async fn run(&self) -> Result<(), TunnelError> {
        let mut tasks: HashMap<SocketId, JoinHandle<()>> = HashMap::new();
        let result = tokio::select! {
            res = self.pump_inbound() => {
                debug!("inbound pump finished: {:?}", res);
                res
            }
            res = self.pump_outbound(&mut tasks) => {
                debug!("outbound pump finished: {:?}", res);
                res
            }
        };
        self.timeouts.cancel();
        self.drain_receive_tasks(tasks).await;
        result
    }

    /// Transport -> sockets. A single consumer, so bytes reach each socket
    /// in transport arrival order.
    async fn pump_inbound(&self) -> Result<(), TunnelError> {
        loop {
            let message = self.timeouts.bound_idle(self.transport.recv()).await?;
            let (payload, id) = frame::split(&message)?;

            if payload.is_empty() {
                // Orderly close for this id. The id may already be gone if
                // the local end failed first; nothing to do then.
                if let Some(context) = self.resolver.lookup(id) {
                    if let Err(e) = context.disconnect().await {
                        debug!("socket {} close failed: {}", id, e);
                    }
                    self.resolver.registry().remove_socket(id);
                }
                continue;
            }

            let context = match self.resolver.resolve(id, self.timeouts.token()).await {
                Ok(context) => context,
                Err(e @ TunnelError::ConnectFailed { .. }) => {
                    // The upstream refused this socket. Tell the peer to
                    // drop its end and keep serving the other ids.
                    warn!("socket {}: {}", id, e);
                    self.timeouts
                        .bound_send(self.transport.send(frame::close(id)))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = context.send(payload).await {
                if self.timeouts.is_cancelled() {
                    return Err(TunnelError::Cancelled);
                }
                warn!("socket {} dropped after send failure: {}", id, e);
                self.resolver.registry().remove_socket(id);
            }
        }
    }

    /// Sockets -> transport supervisor. Keeps one receive task per live id,
    /// re-snapshotting whenever the map membership changes.
    async fn pump_outbound(
        &self,
        tasks: &mut HashMap<SocketId, JoinHandle<()>>,
    ) -> Result<(), TunnelError> {
        loop {
            let snapshot = self.resolver.registry().snapshot()?;

            // Finished tasks leave the table first, so an id that was
            // removed and re-registered between snapshots gets a fresh task.
            let finished: Vec<SocketId> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                if let Some(handle) = tasks.remove(&id) {
                    if let Err(e) = handle.await {
                        if e.is_panic() {
                            error!("socket {} receive task panicked: {e:?}", id);
                        }
                    }
                }
            }

            let departed: Vec<SocketId> = tasks
                .keys()
                .filter(|id| !snapshot.contains(**id))
                .copied()
                .collect();
            for id in departed {
                let handle = tasks.get_mut(&id).expect("departed id is in the table");
                match tokio::time::timeout(REAP_DEADLINE, &mut *handle).await {
                    Ok(join_result) => {
                        if let Err(e) = join_result {
                            if e.is_panic() {
                                error!("socket {} receive task panicked: {e:?}", id);
                            }
                        }
                        tasks.remove(&id);
                    }
                    // Still unwinding; it stays in the table for the next
                    // round.
                    Err(_) => {}
                }
            }

            for (id, context) in snapshot.entries() {
                if !tasks.contains_key(id) {
                    tasks.insert(*id, self.spawn_socket_receive(*id, Arc::clone(context)));
                }
            }

            tokio::select! {
                biased;
                _ = self.timeouts.token().cancelled() => return Ok(()),
                _ = snapshot.lifetime().terminated() => {}
            }
            // The snapshot drops here, detaching from the map before the
            // next one is taken.
        }
    }

    fn spawn_socket_receive(&self, id: SocketId, context: Arc<SocketContext>) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(self.resolver.registry());
        tokio::spawn(socket_receive(id, context, transport, registry))
    }

    async fn drain_receive_tasks(&self, tasks: HashMap<SocketId, JoinHandle<()>>) {
        if tasks.is_empty() {
            return;
        }
        let mut handles: Vec<JoinHandle<()>> = tasks.into_values().collect();
        let drained = {
            let drain = futures::future::join_all(handles.iter_mut());
            tokio::time::timeout(self.timeouts.config().linger_delay, drain).await
        };
        if drained.is_err() {
            warn!("socket receive tasks outlived the linger delay, aborting the stragglers");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

/// Reads chunks from one socket and forwards them as frames until the
/// socket ends, errors, idles out, or the session is cancelled. Always
/// removes its id from the map on the way out.
async fn socket_receive(
    id: SocketId,
    context: Arc<SocketContext>,
    transport: Arc<dyn Transport>,
    registry: Arc<SocketMap>,
) {
    let mut buf = BytesMut::with_capacity(MAX_FRAME_SIZE);
    loop {
        match context.receive(&mut buf, MAX_PAYLOAD_SIZE).await {
            Ok(0) => {
                // The local end closed; propagate the orderly close.
                debug!("socket {} reached end of stream", id);
                let close = context
                    .timeouts()
                    .bound_send(transport.send(frame::close(id)))
                    .await;
                if let Err(e) = close {
                    debug!("socket {} close frame not delivered: {}", id, e);
                }
                break;
            }
            Ok(_) => {
                let message = frame::join(&mut buf, id);
                let sent = context
                    .timeouts()
                    .bound_send(transport.send(message))
                    .await;
                if let Err(e) = sent {
                    warn!("socket {} forward failed: {}", id, e);
                    break;
                }
            }
            Err(TunnelError::Cancelled) => {
                debug!("socket {} receive task cancelled", id);
                break;
            }
            Err(e) => {
                warn!("socket {} receive task exiting: {}", id, e);
                break;
            }
        }
    }
    registry.remove_socket(id);
}
