// src/core/timeouts.rs

//! Scoped deadlines and cancellation for every suspending operation.
//!
//! A [`Timeouts`] instance owns one cancellation root, linked to a
//! caller-provided parent, plus the four configured durations. Each bounded
//! operation races its future against both the matching duration and the
//! root; dropping the composed future on any exit path releases the deadline
//! without affecting the root. Tripping the root permanently fails every
//! current and future operation on the scope.

use crate::core::errors::TunnelError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The four operation deadlines of a tunnel session.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Bound on establishing one outbound TCP connection.
    pub connect_timeout: Duration,
    /// Bound on writing one segment to a socket or one frame to the transport.
    pub send_timeout: Duration,
    /// Bound on waiting for bytes; an idle socket is treated as failed.
    pub idle_timeout: Duration,
    /// Grace period granted to in-flight tasks during teardown.
    pub linger_delay: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            linger_delay: Duration::from_secs(1),
        }
    }
}

/// A cancellation root plus the configured durations for one scope
/// (a session, or a single multiplexed socket).
#[derive(Debug, Clone)]
pub struct Timeouts {
    root: CancellationToken,
    config: TimeoutConfig,
}

impl Timeouts {
    /// Creates a scope whose root is cancelled when `parent` is.
    pub fn new(parent: &CancellationToken, config: TimeoutConfig) -> Self {
        Self {
            root: parent.child_token(),
            config,
        }
    }

    /// The root token of this scope, for linking further children.
    pub fn token(&self) -> &CancellationToken {
        &self.root
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Trips the root, failing every current and future bounded operation on
    /// this scope. Idempotent.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Runs `fut` under the connect deadline. Elapsing surfaces as a
    /// [`TunnelError::ConnectFailed`] for `addr`.
    pub async fn bound_connect<T, F>(&self, addr: &str, fut: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        self.bound(self.config.connect_timeout, fut, || {
            TunnelError::ConnectFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            }
        })
        .await
    }

    /// Runs `fut` under the send deadline.
    pub async fn bound_send<T, F>(&self, fut: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        self.bound(self.config.send_timeout, fut, || TunnelError::SendTimeout)
            .await
    }

    /// Runs `fut` under the idle deadline. The full duration applies to each
    /// call; idleness is elapsed wait, not an activity counter.
    pub async fn bound_idle<T, F>(&self, fut: F) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        self.bound(self.config.idle_timeout, fut, || TunnelError::ReceiveTimeout)
            .await
    }

    /// Sleeps for the linger delay, returning early when the root fires.
    pub async fn linger(&self) {
        tokio::select! {
            biased;
            _ = self.root.cancelled() => {}
            _ = tokio::time::sleep(self.config.linger_delay) => {}
        }
    }

    async fn bound<T, F>(
        &self,
        duration: Duration,
        fut: F,
        on_elapsed: impl FnOnce() -> TunnelError,
    ) -> Result<T, TunnelError>
    where
        F: Future<Output = Result<T, TunnelError>>,
    {
        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(TunnelError::Cancelled),
            result = tokio::time::timeout(duration, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(on_elapsed()),
            },
        }
    }
}
