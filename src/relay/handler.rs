//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and manages the connection lifecycle.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::frame::Inbound;
use super::registry::{ConnectionSet, Registration};
use super::RelayState;

/// How long the writer gets to send a close frame once a connection ends
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
///
/// This is the entry point for every peer, producer or consumer alike.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();

    let Registration {
        id: connection_id,
        mut outbound,
        cancel,
    } = match state.connections.register(&state.shutdown).await {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting WebSocket connection");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let conn_id_for_send = connection_id.clone();
    let cancel_for_send = cancel.clone();
    let idle_timeout = state.config.idle_timeout();
    let mut heartbeat = idle_timeout.map(heartbeat_interval);

    // Task to drain this connection's queue into the socket
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel_for_send.cancelled() => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "relay closed the connection".into(),
                        })))
                        .await;
                    break;
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(frame.into_message()).await.is_err() {
                        tracing::debug!(
                            connection_id = %conn_id_for_send,
                            "WebSocket send failed, closing connection"
                        );
                        break;
                    }
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let connections = Arc::clone(&state.connections);
    let conn_id_for_recv = connection_id.clone();

    // Task to read frames from the peer and fan them out. Any inbound
    // message, pongs included, counts as activity.
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::info!(
                            connection_id = %conn_id_for_recv,
                            idle_secs = limit.as_secs(),
                            "Idle timeout, closing connection"
                        );
                        break;
                    }
                },
                None => receiver.next().await,
            };

            let Some(result) = next else { break };
            match result {
                Ok(msg) => {
                    if !handle_ws_message(&connections, &conn_id_for_recv, msg).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %conn_id_for_recv,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    });

    // Wait for either task to complete, or for eviction/shutdown
    let send_finished = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
        _ = cancel.cancelled() => false,
    };

    // Let the writer send its close frame before the socket is dropped
    cancel.cancel();
    if !send_finished && tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
    recv_task.abort();

    // Cleanup: unregister from the set (no-op if already evicted)
    state.connections.unregister(&connection_id).await;
}

/// Pings go out twice per idle window, so a peer that only listens still
/// answers within it
fn heartbeat_interval(idle_timeout: Duration) -> Interval {
    let period = (idle_timeout / 2).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Next heartbeat tick; never resolves when heartbeats are off
async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle a received WebSocket message
///
/// Returns false if the connection should be closed.
async fn handle_ws_message(
    connections: &ConnectionSet,
    connection_id: &str,
    message: Message,
) -> bool {
    match Inbound::from(message) {
        Inbound::Forward(frame) => {
            tracing::debug!(
                connection_id = %connection_id,
                kind = frame.kind(),
                payload = %frame.to_text_lossy(),
                "Received"
            );
            connections.broadcast(connection_id, &frame).await;
            true
        }
        // Axum answers pings itself
        Inbound::Control => true,
        Inbound::Close => {
            tracing::debug!(connection_id = %connection_id, "Client requested close");
            connections.mark_closing(connection_id).await;
            false
        }
    }
}
