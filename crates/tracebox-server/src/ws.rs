//! Websocket bridge between a browser connection and a [`Session`].

use axum::extract::ws::{Message, WebSocket};
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracebox_core::{SandboxConfig, ServerMessage, Session};

/// Run one session over `socket` until either side goes away.
pub async fn handle_socket(
    socket: WebSocket,
    config: Arc<SandboxConfig>,
    shutdown: broadcast::Receiver<()>,
) {
    let (mut sink, stream) = socket.split();
    let (outbound, mut messages) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!(error = %e, "Websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Only text frames carry commands; binary and control frames are dropped.
    let inbound = stream.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });

    let session = Session::new(config, outbound);
    let session_id = session.id();
    session.run(inbound, shutdown).await;

    if let Err(e) = writer.await {
        tracing::warn!(session_id = %session_id, error = %e, "Websocket writer task failed");
    }
}
