// src/connection/autoconnect.rs

//! The server-side socket map: connects to the configured upstream target
//! the first time an id is seen.
//!
//! The lookup and the insert are not one critical section: the connect
//! await happens outside the map lock so slow upstreams never serialize
//! unrelated lookups. Two frames racing for the same fresh id can therefore
//! both reach the connect path; the inner map's duplicate detection settles
//! the race, and the loser discards its socket and retries the lookup.

use crate::connection::registry::SocketMap;
use crate::connection::socket::SocketContext;
use crate::core::errors::TunnelError;
use crate::core::frame::SocketId;
use crate::core::multiplexer::SocketResolver;
use crate::core::timeouts::{TimeoutConfig, Timeouts};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wraps a [`SocketMap`] with a fixed upstream target, creating sockets on
/// demand.
pub struct AutoConnectMap {
    registry: Arc<SocketMap>,
    target: String,
    config: TimeoutConfig,
    /// Parent of every created context's cancellation root, so session
    /// teardown aborts in-flight connects.
    session: CancellationToken,
}

impl AutoConnectMap {
    pub fn new(
        registry: Arc<SocketMap>,
        target: String,
        config: TimeoutConfig,
        session: CancellationToken,
    ) -> Self {
        Self {
            registry,
            target,
            config,
            session,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the registered context for `id`, connecting a fresh socket to
    /// the target when the id is new. `cancel` aborts a pending connect.
    pub async fn get_or_connect(
        &self,
        id: SocketId,
        cancel: &CancellationToken,
    ) -> Result<Arc<SocketContext>, TunnelError> {
        loop {
            if let Some(context) = self.registry.get_socket(id) {
                return Ok(context);
            }

            let timeouts = Timeouts::new(&self.session, self.config.clone());
            let context = Arc::new(SocketContext::lazy(id, self.target.clone(), timeouts));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    context.dispose();
                    return Err(TunnelError::Cancelled);
                }
                result = context.connect() => result?,
            }

            match self.registry.add_socket(Arc::clone(&context)) {
                Ok(()) => return Ok(context),
                Err(TunnelError::DuplicateSocket(_)) => {
                    // Lost the connect race; the registered winner stands.
                    debug!("socket {} connect race lost, discarding the extra socket", id);
                    context.dispose();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl SocketResolver for AutoConnectMap {
    async fn resolve(
        &self,
        id: SocketId,
        cancel: &CancellationToken,
    ) -> Result<Arc<SocketContext>, TunnelError> {
        self.get_or_connect(id, cancel).await
    }

    fn lookup(&self, id: SocketId) -> Option<Arc<SocketContext>> {
        self.registry.get_socket(id)
    }

    fn registry(&self) -> &Arc<SocketMap> {
        &self.registry
    }
}
