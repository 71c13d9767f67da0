// src/listener/mod.rs

//! The listener driver: accepts local TCP clients and forwards each of them,
//! multiplexed, through one long-lived outbound WebSocket.

use crate::config::{Config, bind_addr};
use crate::connection::{SocketContext, SocketMap};
use crate::core::frame::SocketId;
use crate::core::multiplexer::{Multiplexer, RegisteredOnly};
use crate::core::timeouts::Timeouts;
use crate::core::transport::{WebSocketTransport, websocket_config};
use crate::shutdown::await_shutdown_signal;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async_with_config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the listener side until the tunnel ends or a shutdown signal
/// arrives. Tunnel failure terminates the session; there is no reconnection
/// of the outer tunnel.
pub async fn run(config: Config) -> Result<()> {
    let listen_addr = bind_addr("listen_on", &config.listen_on)?;
    let timeout_config = config.timeout_config();

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind local listener on {listen_addr}"))?;
    info!("Listening for local clients on {listen_addr}");

    let dial = connect_async_with_config(config.tunnel_to.as_str(), Some(websocket_config()), false);
    let (ws, _response) = tokio::time::timeout(timeout_config.connect_timeout, dial)
        .await
        .map_err(|_| anyhow!("timed out connecting to tunnel '{}'", config.tunnel_to))?
        .with_context(|| format!("WebSocket handshake with '{}' failed", config.tunnel_to))?;
    info!("Tunnel established to {}", config.tunnel_to);

    let session = CancellationToken::new();
    let registry = Arc::new(SocketMap::new());
    let resolver = Arc::new(RegisteredOnly::new(Arc::clone(&registry)));
    let multiplexer = Multiplexer::new(
        Arc::new(WebSocketTransport::new(ws)),
        resolver,
        &session,
        timeout_config.clone(),
    );
    let mut mux_task = tokio::spawn(async move { multiplexer.run().await });

    // Ids are session-scoped, so a monotonic counter is collision-free.
    let mut id_counter: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            }

            res = &mut mux_task => {
                match res {
                    Ok(Ok(())) => info!("Tunnel session ended."),
                    Ok(Err(e)) => error!("Tunnel session failed: {e}"),
                    Err(e) => error!("Tunnel session panicked: {e:?}"),
                }
                session.cancel();
                registry.reset();
                return Ok(());
            }

            res = listener.accept() => {
                match res {
                    Ok((stream, addr)) => {
                        id_counter = id_counter.wrapping_add(1);
                        let id = SocketId(id_counter);
                        info!("Accepted client {addr} as socket {id}");
                        let timeouts = Timeouts::new(&session, timeout_config.clone());
                        let context = Arc::new(SocketContext::connected(id, stream, timeouts));
                        if let Err(e) = registry.add_socket(context) {
                            error!("Failed to register socket {id}: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            }
        }
    }

    // Graceful shutdown: fail every socket, then give the session the
    // linger delay to unwind.
    session.cancel();
    registry.reset();
    if tokio::time::timeout(timeout_config.linger_delay, &mut mux_task)
        .await
        .is_err()
    {
        warn!("Tunnel session did not unwind within the linger delay.");
        mux_task.abort();
    }
    info!("Listener shutdown complete.");
    Ok(())
}
