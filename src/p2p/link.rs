//! Per-link tasks
//!
//! Every link is split into a writer task that drains the peer's outbox into
//! the socket and a reader loop that feeds inbound messages to the registry's
//! dispatcher. The tasks only hold a weak reference to the registry; once the
//! reader stops, the peer is deregistered.

use super::protocol::Message;
use super::Registry;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Weak;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;

/// Start the reader and writer for an established link
pub(crate) fn spawn<S>(
    registry: Weak<Registry>,
    peer_id: String,
    ws: WebSocketStream<S>,
    outbox: mpsc::UnboundedReceiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_loop(sink, outbox, peer_id.clone()));

    tokio::spawn(async move {
        read_loop(stream, &registry, &peer_id).await;
        writer.abort();
        if let Some(registry) = registry.upgrade() {
            registry.deregister(&peer_id);
        }
    });
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Frame>,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    peer_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = outbox.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {} for {}: {}", message.kind(), peer_id, e);
                continue;
            }
        };

        if let Err(e) = sink.send(Frame::text(text)).await {
            log::debug!("Write to peer {} failed: {}", peer_id, e);
            return;
        }
    }

    // Outbox dropped: the peer was deregistered locally
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, registry: &Weak<Registry>, peer_id: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Peer {} error: {}", peer_id, e);
                return;
            }
        };

        match frame {
            Frame::Text(text) => {
                let message = match Message::decode(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Dropping message from peer {}: {}", peer_id, e);
                        continue;
                    }
                };

                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.dispatch(peer_id, message).await;
            }
            Frame::Binary(data) => {
                log::warn!("Dropping {}-byte binary frame from peer {}", data.len(), peer_id);
            }
            Frame::Close(_) => return,
            // Ping/pong are answered by tungstenite itself
            _ => {}
        }
    }
}
