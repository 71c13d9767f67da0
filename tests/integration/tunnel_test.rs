// tests/integration/tunnel_test.rs

//! One tunnel over a real WebSocket on loopback: the listener harness dials
//! the server driver's session entry point through `tokio-tungstenite`.

use super::fixtures;
use burrow::core::TunnelError;
use burrow::core::transport::{WebSocketTransport, websocket_config};
use burrow::server;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async_with_config;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_websocket_tunnel_end_to_end() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;

    // The server end: accept one tunnel and run a session over it.
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let session_config = config.clone();
    let session_shutdown = shutdown.clone();
    let target = echo.to_string();
    let server_task = tokio::spawn(async move {
        let (stream, _) = ws_listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config()))
            .await
            .unwrap();
        server::run_session(ws, target, session_config, session_shutdown).await
    });

    // The listener end dials the tunnel.
    let url = format!("ws://{ws_addr}");
    let (ws, _response) = connect_async_with_config(url.as_str(), Some(websocket_config()), false)
        .await
        .unwrap();
    let listener =
        fixtures::spawn_listener_session(Arc::new(WebSocketTransport::new(ws)), config.clone());

    let mut client = fixtures::register_client(&listener, &config, 1).await;
    client.write_all(b"through the tunnel").await.unwrap();
    let mut reply = [0u8; 18];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"through the tunnel");

    // Client close drains the id from the listener map.
    client.shutdown().await.unwrap();
    fixtures::wait_until(Duration::from_secs(2), || listener.registry.is_empty()).await;

    // Cancelling the server session tears the WebSocket down, which ends
    // the listener session too.
    shutdown.cancel();
    let server_result = tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("server session should unwind promptly")
        .unwrap();
    assert!(matches!(server_result, Ok(()) | Err(TunnelError::Cancelled)));

    let listener_result = tokio::time::timeout(Duration::from_secs(2), listener.mux)
        .await
        .expect("listener session should unwind promptly")
        .unwrap();
    assert!(listener_result.is_err());
}
