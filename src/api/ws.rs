//! Websocket adapter for the session loop

use crate::runtime::{Transport, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde_json::Value;
use std::borrow::Cow;

/// Close reasons must fit in a control frame
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// [`Transport`] over one upgraded axum websocket.
///
/// Frames are JSON text. Ping/pong is answered by axum and skipped here.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Value) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "Websocket send failed, client disconnected");
                TransportError::Closed
            })
    }

    async fn receive(&mut self) -> Result<Value, TransportError> {
        loop {
            let message = match self.socket.recv().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Websocket receive failed");
                    return Err(TransportError::Closed);
                }
                None => return Err(TransportError::Closed),
            };

            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| TransportError::Malformed(format!("invalid JSON: {e}")));
                }
                Message::Binary(_) => {
                    return Err(TransportError::Malformed(
                        "binary frames are not supported".to_string(),
                    ));
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return Err(TransportError::Closed),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(truncate_reason(reason).to_string()),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    match reason
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|end| *end <= MAX_CLOSE_REASON_BYTES)
        .last()
    {
        Some(end) => reason.get(..end).unwrap_or_default(),
        None => "",
    }
}
