//! WebSocket transport
//!
//! One envelope per request: connect, send, await the reply, close.
//! The server side answers every inbound envelope through the supplied
//! handler and tolerates malformed frames without dropping the listener.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, warn};

use crate::record::DeviceId;

use super::{NetError, RequestHandler, Transport, WireEnvelope, MAX_WIRE_MESSAGE};

#[derive(Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn request(
        &self,
        endpoint: &str,
        envelope: WireEnvelope,
    ) -> Result<WireEnvelope, NetError> {
        let url = format!("ws://{endpoint}");
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        let bytes = serde_json::to_vec(&envelope)?;
        if bytes.len() > MAX_WIRE_MESSAGE {
            return Err(NetError::TooLarge(bytes.len()));
        }
        ws.send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| NetError::Protocol(e.to_string()))?;

        while let Some(message) = ws.next().await {
            match message.map_err(|e| NetError::Protocol(e.to_string()))? {
                Message::Binary(data) => {
                    if data.len() > MAX_WIRE_MESSAGE {
                        return Err(NetError::TooLarge(data.len()));
                    }
                    let reply: WireEnvelope = serde_json::from_slice(&data)?;
                    let _ = ws.close(None).await;
                    return Ok(reply);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(NetError::Protocol("connection closed before reply".into()))
    }
}

/// Bind a listener and answer envelopes until the task is aborted.
/// Returns the bound address (useful with port 0) and the accept-loop
/// handle.
pub async fn serve(
    addr: &str,
    device_id: DeviceId,
    handler: Arc<dyn RequestHandler>,
) -> Result<(SocketAddr, JoinHandle<()>), NetError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, device_id, handler).await {
                    debug!(peer = %peer_addr, "connection ended with error: {e}");
                }
            });
        }
    });

    Ok((local_addr, handle))
}

async fn serve_connection(
    stream: TcpStream,
    device_id: DeviceId,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), NetError> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| NetError::Protocol(e.to_string()))?;

    while let Some(message) = ws.next().await {
        match message.map_err(|e| NetError::Protocol(e.to_string()))? {
            Message::Binary(data) => {
                let reply = if data.len() > MAX_WIRE_MESSAGE {
                    WireEnvelope::error(device_id, "message too large")
                } else {
                    match serde_json::from_slice::<WireEnvelope>(&data) {
                        Ok(envelope) => handler.handle(envelope).await,
                        Err(e) => WireEnvelope::error(device_id, format!("bad envelope: {e}")),
                    }
                };
                ws.send(Message::Binary(serde_json::to_vec(&reply)?.into()))
                    .await
                    .map_err(|e| NetError::Protocol(e.to_string()))?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
