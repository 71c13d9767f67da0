// src/core/transport.rs

//! The outer duplex message channel shared by all multiplexed sockets.
//!
//! The multiplexer only requires an ordered, reliable, message-preserving
//! binary channel; in production that is a WebSocket. Receivers take `&self`
//! so one sender can be shared by every per-socket task while a single
//! consumer drains the other direction.

use crate::core::errors::TunnelError;
use crate::core::frame::MAX_FRAME_SIZE;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// An ordered, reliable, message-preserving duplex channel of binary frames.
///
/// On failure of either direction, both directions become unusable.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one complete message. Concurrent senders are serialized.
    async fn send(&self, frame: Bytes) -> Result<(), TunnelError>;

    /// Receives the next complete message.
    async fn recv(&self) -> Result<Bytes, TunnelError>;
}

/// The WebSocket configuration every tunnel endpoint uses: message and frame
/// sizes capped at the protocol maximum.
pub fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_SIZE))
        .max_frame_size(Some(MAX_FRAME_SIZE))
}

/// Adapts a `tokio-tungstenite` stream to the [`Transport`] contract.
///
/// The sink and stream halves live behind separate locks so sends from many
/// socket tasks interleave with the single receive consumer.
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Bytes) -> Result<(), TunnelError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TunnelError::TransportClosed(e.to_string()))
    }

    async fn recv(&self) -> Result<Bytes, TunnelError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                // Ping/Pong are answered by the library on the next I/O.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(TunnelError::TransportClosed(
                        "unexpected text message on a binary tunnel".to_string(),
                    ));
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(TunnelError::TransportClosed(
                        "close frame received".to_string(),
                    ));
                }
                Some(Err(e)) => return Err(TunnelError::TransportClosed(e.to_string())),
                None => {
                    return Err(TunnelError::TransportClosed(
                        "connection closed by peer".to_string(),
                    ));
                }
            }
        }
    }
}
