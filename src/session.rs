//! Peer session: one live WebSocket bound to one document actor.
//!
//! Owns the socket read loop, the outbound queue, and the keep-alive ping
//! cycle. Frames are binary-only and decoded here; a malformed frame is
//! logged and dropped without closing the socket — one bad frame must not
//! disconnect an otherwise healthy peer. Every exit path runs `detach`
//! exactly once.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::sync::Message;
use yrs::updates::decoder::Decode;

use crate::actor::{DocHandle, PEER_QUEUE};

/// Run the session until the socket dies, the ping times out, or the actor
/// goes away.
pub async fn run<S>(ws: WebSocketStream<S>, handle: DocHandle, ping_interval: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(PEER_QUEUE);

    if handle.attach(peer, out_tx).await.is_err() {
        warn!("peer {peer}: doc {} closed before attach", handle.name());
        return;
    }
    info!("peer {peer}: attached to doc {}", handle.name());

    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    let mut pong_pending = false;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Binary(data))) => {
                    if data.is_empty() {
                        warn!("peer {peer}: dropping empty frame");
                        continue;
                    }
                    match Message::decode_v1(&data) {
                        Ok(message) => {
                            if handle.frame(peer, message).await.is_err() {
                                debug!("peer {peer}: doc {} closed", handle.name());
                                break;
                            }
                        }
                        Err(e) => warn!("peer {peer}: dropping malformed frame: {e}"),
                    }
                }
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("peer {peer}: text frames are rejected");
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if sink.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    pong_pending = false;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("peer {peer}: socket closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("peer {peer}: socket error: {e}");
                    break;
                }
            },
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    if sink.send(WsMessage::Binary(frame)).await.is_err() {
                        debug!("peer {peer}: send failed, treating socket as closed");
                        break;
                    }
                }
                // The actor dropped us (close or supervisor teardown).
                None => break,
            },
            _ = ping.tick() => {
                if pong_pending {
                    warn!("peer {peer}: ping timed out, terminating");
                    break;
                }
                pong_pending = true;
                if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.detach(peer).await;
    let _ = sink.close().await;
    info!("peer {peer}: detached from doc {}", handle.name());
}
