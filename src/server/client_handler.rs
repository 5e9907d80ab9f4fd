// ABOUTME: WebSocket client handler
// ABOUTME: Runs the clock handshake, joins the session and forwards decoded commands

use crate::error::Error;
use crate::protocol::command::ClientCommand;
use crate::protocol::messages::WireMessage;
use crate::server::clock::ServerClock;
use crate::server::config::ServerConfig;
use crate::server::handshake::negotiate_clock;
use crate::server::member::SessionMember;
use crate::server::session::SessionHandle;
use crate::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle a WebSocket connection for `username` in `session`
pub async fn handle_client(
    socket: WebSocket,
    session: SessionHandle,
    username: String,
    clock: Arc<ServerClock>,
    config: Arc<ServerConfig>,
) {
    let session_id = session.id().to_string();
    let (ws_tx, ws_rx) = socket.split();
    let mut inbound = ws_rx.filter_map(|frame| future::ready(decode_frame(frame)));

    // One writer per connection keeps sends to this member serialized
    let (tx, rx) = mpsc::unbounded_channel::<WireMessage>();
    let send_name = username.clone();
    let write_timeout = config.write_timeout();
    let mut send_task = tokio::spawn(async move {
        write_outbound(ws_tx, rx, &send_name, write_timeout).await;
    });

    log::info!("{}: {}: starting handshake", session_id, username);
    let clock_sync = match negotiate_clock(
        &tx,
        &mut inbound,
        &clock,
        config.handshake_rounds,
        config.handshake_timeout(),
    )
    .await
    {
        Ok(sync) => sync,
        Err(e) => {
            log::warn!("{}: {}: handshake failed: {}", session_id, username, e);
            let _ = tx.send(WireMessage::text(format!("Clock handshake failed: {}", e)));
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };
    log::info!(
        "{}: {}: handshake complete: latency {}ms, offset {}ms",
        session_id,
        username,
        clock_sync.latency_millis,
        clock_sync.offset_millis
    );

    let member = SessionMember::new(username.clone(), clock_sync, tx.clone());
    if let Err(e) = session.join(member).await {
        log::warn!("{}: {}: join rejected: {}", session_id, username, e);
        let _ = tx.send(WireMessage::text(e.to_string()));
        drop(tx);
        let _ = send_task.await;
        return;
    }

    // A stalled writer ends the connection even while the peer keeps sending
    let reason = tokio::select! {
        reason = forward_commands(&session, &username, &tx, &mut inbound) => reason,
        _ = &mut send_task => Error::Channel("outbound writes stalled".to_string()),
    };
    log::info!("{}: {} disconnected: {}", session_id, username, reason);

    // Cleanup
    session.leave(&username);
    send_task.abort();
}

/// Writer loop for one connection
///
/// Failed sends are logged and skipped; the read loop notices a dead peer.
/// A frame that waits longer than `write_timeout` on a stalled peer stops
/// the writer and drops the queue.
async fn write_outbound<W>(
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
    name: &str,
    write_timeout: Duration,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(msg) = rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize message for {}: {}", name, e);
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(json.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Send to {} failed: {}", name, e),
            Err(_) => {
                log::warn!(
                    "Send to {} stalled for {}ms, dropping connection",
                    name,
                    write_timeout.as_millis()
                );
                return;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Map one WebSocket frame to an inbound item; control frames are skipped
fn decode_frame(
    frame: std::result::Result<WsMessage, axum::Error>,
) -> Option<Result<WireMessage>> {
    match frame {
        Ok(WsMessage::Text(text)) => Some(WireMessage::from_json(&text)),
        Ok(WsMessage::Binary(data)) => Some(Err(Error::Protocol(format!(
            "unexpected binary frame ({} bytes)",
            data.len()
        )))),
        // Handled automatically by axum
        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => None,
        Ok(WsMessage::Close(_)) => Some(Err(Error::Channel("client closed connection".to_string()))),
        Err(e) => Some(Err(e.into())),
    }
}

/// Read loop: only enqueues onto the session, never mutates it
///
/// Protocol errors go back to this connection only. Returns the channel
/// failure that ended the loop.
async fn forward_commands<S>(
    session: &SessionHandle,
    username: &str,
    reply: &mpsc::UnboundedSender<WireMessage>,
    inbound: &mut S,
) -> Error
where
    S: Stream<Item = Result<WireMessage>> + Unpin,
{
    while let Some(item) = inbound.next().await {
        let command = match item.and_then(ClientCommand::decode) {
            Ok(ClientCommand::HandshakeAck(_)) => {
                Err(Error::Protocol("handshake ack outside of a handshake".to_string()))
            }
            other => other,
        };

        match command {
            Ok(command) => {
                if let Err(e) = session.submit(username, command) {
                    return e;
                }
            }
            Err(Error::Protocol(reason)) => {
                log::debug!("{}: {}: protocol error: {}", session.id(), username, reason);
                let _ = reply.send(WireMessage::text(format!("Protocol error: {}", reason)));
            }
            Err(e) => return e,
        }
    }
    Error::Channel("connection closed".to_string())
}
