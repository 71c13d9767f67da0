// tests/integration/multiplex_test.rs

//! End-to-end multiplex sessions over the in-memory transport: relay
//! correctness, close propagation, and failure containment.

use super::fixtures::{self, SessionHarness};
use burrow::core::TunnelError;
use burrow::core::frame::{self, SocketId};
use burrow::core::timeouts::TimeoutConfig;
use burrow::core::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Stands up listener <-> server sessions joined by the in-memory transport,
/// with the server auto-connecting to `target`.
fn linked_sessions(
    target: String,
    config: &TimeoutConfig,
) -> (SessionHarness, SessionHarness, tokio_util::sync::CancellationToken) {
    let (listener_end, server_end, kill) = fixtures::transport_pair();
    let listener = fixtures::spawn_listener_session(Arc::new(listener_end), config.clone());
    let server = fixtures::spawn_server_session(Arc::new(server_end), target, config.clone());
    (listener, server, kill)
}

#[tokio::test]
async fn test_echo_round_trip_and_close_propagation() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;
    let (listener, server, _kill) = linked_sessions(echo.to_string(), &config);

    let mut client = fixtures::register_client(&listener, &config, 1).await;
    client.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello");

    // Closing the client propagates the orderly close across the tunnel and
    // both maps drop the id.
    client.shutdown().await.unwrap();
    fixtures::wait_until(Duration::from_secs(2), || {
        listener.registry.is_empty() && server.registry.is_empty()
    })
    .await;

    listener.session.cancel();
    server.session.cancel();
    let _ = listener.mux.await.unwrap();
    let _ = server.mux.await.unwrap();
}

#[tokio::test]
async fn test_two_streams_are_isolated() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;
    let (listener, server, _kill) = linked_sessions(echo.to_string(), &config);

    const LEN: usize = 128 * 1024;
    let data_one = fixtures::patterned_bytes(0, LEN);
    let data_two = fixtures::patterned_bytes(101, LEN);

    let client_one = fixtures::register_client(&listener, &config, 1).await;
    let client_two = fixtures::register_client(&listener, &config, 2).await;

    let mut readers = Vec::new();
    for (client, data) in [(client_one, data_one), (client_two, data_two)] {
        let (mut read_half, mut write_half) = client.into_split();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            write_half.write_all(&data).await.unwrap();
            // Keep the write half open until the echo drains back.
            write_half
        });
        readers.push(tokio::spawn(async move {
            let mut received = vec![0u8; LEN];
            read_half.read_exact(&mut received).await.unwrap();
            assert_eq!(received, expected, "stream bytes were mixed or reordered");
            writer.await.unwrap()
        }));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    listener.session.cancel();
    server.session.cancel();
    let _ = listener.mux.await.unwrap();
    let _ = server.mux.await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_terminates_the_session() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;
    let (transport, peer, _kill) = fixtures::transport_pair();
    let server = fixtures::spawn_server_session(Arc::new(transport), echo.to_string(), config);

    peer.send(Bytes::from_static(&[1, 2, 3, 4])).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), server.mux)
        .await
        .expect("session should terminate promptly")
        .unwrap();
    assert!(matches!(result, Err(TunnelError::MalformedFrame(4))));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_is_contained() {
    let config = fixtures::fast_timeouts();
    let target = fixtures::unreachable_addr().await;
    let (transport, peer, _kill) = fixtures::transport_pair();
    let server = fixtures::spawn_server_session(Arc::new(transport), target.to_string(), config);

    // A data frame for a fresh id hits the refused upstream; the peer gets
    // the orderly-close frame back instead of losing the session.
    let mut buf = BytesMut::from(&b"hi"[..]);
    peer.send(frame::join(&mut buf, SocketId(7))).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    let (payload, id) = frame::split(&reply).unwrap();
    assert!(payload.is_empty());
    assert_eq!(id, SocketId(7));

    // The session stays alive for further ids.
    assert!(!server.mux.is_finished());
    buf.extend_from_slice(b"again");
    peer.send(frame::join(&mut buf, SocketId(8))).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    let (payload, id) = frame::split(&reply).unwrap();
    assert!(payload.is_empty());
    assert_eq!(id, SocketId(8));
    assert!(server.registry.is_empty());

    server.session.cancel();
    let _ = server.mux.await.unwrap();
}

#[tokio::test]
async fn test_close_frame_for_unknown_id_is_ignored() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;
    let (transport, peer, _kill) = fixtures::transport_pair();
    let server = fixtures::spawn_server_session(Arc::new(transport), echo.to_string(), config);

    peer.send(frame::close(SocketId(99))).await.unwrap();

    // The session still serves data frames afterwards.
    let mut buf = BytesMut::from(&b"ping"[..]);
    peer.send(frame::join(&mut buf, SocketId(1))).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .unwrap()
        .unwrap();
    let (payload, id) = frame::split(&reply).unwrap();
    assert_eq!(payload, b"ping");
    assert_eq!(id, SocketId(1));

    server.session.cancel();
    let _ = server.mux.await.unwrap();
}

#[tokio::test]
async fn test_transport_drop_unwinds_both_sessions() {
    let config = fixtures::fast_timeouts();
    let echo = fixtures::echo_server().await;
    let (listener, server, kill) = linked_sessions(echo.to_string(), &config);

    let mut client = fixtures::register_client(&listener, &config, 1).await;
    client.write_all(b"mid-transfer").await.unwrap();
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();

    // Sever the tunnel under the live connection.
    kill.cancel();

    let listener_result = tokio::time::timeout(Duration::from_secs(2), listener.mux)
        .await
        .expect("listener session should unwind promptly")
        .unwrap();
    assert!(listener_result.is_err());
    let server_result = tokio::time::timeout(Duration::from_secs(2), server.mux)
        .await
        .expect("server session should unwind promptly")
        .unwrap();
    assert!(server_result.is_err());

    // All sockets were disposed; the client observes its connection ending.
    assert!(listener.registry.is_empty());
    assert!(server.registry.is_empty());
    let mut buf = [0u8; 16];
    let eof = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client connection should be closed");
    assert!(matches!(eof, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_idle_socket_is_evicted_without_ending_the_session() {
    let config = TimeoutConfig {
        connect_timeout: Duration::from_millis(1000),
        send_timeout: Duration::from_millis(2000),
        idle_timeout: Duration::from_millis(300),
        linger_delay: Duration::from_millis(300),
    };
    let echo = fixtures::echo_server().await;
    let (transport, peer, _kill) = fixtures::transport_pair();
    let server =
        fixtures::spawn_server_session(Arc::new(transport), echo.to_string(), config.clone());
    let peer = Arc::new(peer);

    // Drain everything the server sends so the channel never backs up.
    let drain = Arc::clone(&peer);
    tokio::spawn(async move { while drain.recv().await.is_ok() {} });

    // Socket 1 goes quiet after one exchange.
    let mut buf = BytesMut::from(&b"one shot"[..]);
    peer.send(frame::join(&mut buf, SocketId(1))).await.unwrap();
    fixtures::wait_until(Duration::from_secs(2), || {
        server.registry.get_socket(SocketId(1)).is_some()
    })
    .await;

    // Socket 2 keeps chattering, which also keeps the tunnel busy.
    let chatter_peer = Arc::clone(&peer);
    tokio::spawn(async move {
        loop {
            let mut buf = BytesMut::from(&b"tick"[..]);
            if chatter_peer
                .send(frame::join(&mut buf, SocketId(2)))
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    // The idle socket is evicted; the chatty one and the session survive.
    fixtures::wait_until(Duration::from_secs(3), || {
        server.registry.get_socket(SocketId(1)).is_none()
            && server.registry.get_socket(SocketId(2)).is_some()
    })
    .await;
    assert!(!server.mux.is_finished());

    server.session.cancel();
    let _ = server.mux.await.unwrap();
}
