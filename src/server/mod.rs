// src/server/mod.rs

//! The server driver: accepts WebSocket tunnels and originates TCP
//! connections to the configured upstream target, one independent multiplex
//! session per tunnel.

use crate::config::{Config, bind_addr};
use crate::connection::{AutoConnectMap, SocketMap};
use crate::core::errors::TunnelError;
use crate::core::multiplexer::Multiplexer;
use crate::core::timeouts::TimeoutConfig;
use crate::core::transport::{WebSocketTransport, websocket_config};
use crate::shutdown::await_shutdown_signal;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the server side until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let listen_addr = bind_addr("listen_on", &config.listen_on)?;
    let target = bind_addr("tunnel_to", &config.tunnel_to)?;
    let timeout_config = config.timeout_config();

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind tunnel endpoint on {listen_addr}"))?;
    info!("Listening for tunnels on {listen_addr}, forwarding to {target}");

    let shutdown = CancellationToken::new();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            }

            Some(res) = sessions.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("A tunnel session panicked: {e:?}");
                    }
                }
            }

            res = listener.accept() => {
                match res {
                    Ok((stream, addr)) => {
                        info!("Accepted tunnel connection from {addr}");
                        let target = target.clone();
                        let config = timeout_config.clone();
                        let token = shutdown.child_token();
                        sessions.spawn(async move {
                            let handshake =
                                tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config())).await;
                            match handshake {
                                Ok(ws) => match run_session(ws, target, config, token).await {
                                    Ok(()) | Err(TunnelError::Cancelled) => {
                                        info!("Tunnel session for {addr} ended.");
                                    }
                                    Err(e) => warn!("Tunnel session for {addr} failed: {e}"),
                                },
                                Err(e) => warn!("WebSocket handshake with {addr} failed: {e}"),
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {e}"),
                }
            }
        }
    }

    // Graceful shutdown: cancel every session, then drain with a bounded
    // wait before aborting the stragglers.
    info!("Shutting down. Cancelling all tunnel sessions.");
    shutdown.cancel();
    let drain = async {
        while sessions.join_next().await.is_some() {}
    };
    if tokio::time::timeout(timeout_config.linger_delay, drain)
        .await
        .is_err()
    {
        warn!("Timed out waiting for tunnel sessions to finish cleanly.");
        sessions.shutdown().await;
    }
    info!("Server shutdown complete.");
    Ok(())
}

/// Runs one multiplex session over an accepted WebSocket, auto-connecting
/// each new socket id to `target`. The registry and every context are
/// disposed on the way out.
pub async fn run_session(
    ws: WebSocketStream<TcpStream>,
    target: String,
    config: TimeoutConfig,
    parent: CancellationToken,
) -> Result<(), TunnelError> {
    let session = parent.child_token();
    let registry = Arc::new(SocketMap::new());
    let resolver = Arc::new(AutoConnectMap::new(
        Arc::clone(&registry),
        target,
        config.clone(),
        session.clone(),
    ));
    let multiplexer = Multiplexer::new(
        Arc::new(WebSocketTransport::new(ws)),
        resolver,
        &session,
        config,
    );

    let result = multiplexer.run().await;
    session.cancel();
    registry.reset();
    result
}
