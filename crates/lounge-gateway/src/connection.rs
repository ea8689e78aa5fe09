use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use lounge_types::events::ClientCommand;

use crate::coordinator::RoomCoordinator;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle one WebSocket connection until either side closes it.
pub async fn handle_connection(socket: WebSocket, coordinator: RoomCoordinator) {
    let (mut sender, mut receiver) = socket.split();
    let (socket_id, mut events) = coordinator.connect().await;
    info!(socket_id, "Socket connected");

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward targeted and room events -> client, with heartbeat
    let send_socket_id = socket_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(socket_id = %send_socket_id, "Could not encode {}: {}", event.kind(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(socket_id = %send_socket_id, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client, one at a time so per-socket order holds
    let recv_coordinator = coordinator.clone();
    let recv_socket_id = socket_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        trace!(socket_id = %recv_socket_id, ?command, "Command");
                        recv_coordinator.handle(&recv_socket_id, command).await;
                    }
                    Err(e) => {
                        warn!(
                            socket_id = %recv_socket_id,
                            "bad command: {} -- raw: {}",
                            e,
                            truncate_for_log(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    coordinator.disconnect(&socket_id).await;
    info!(socket_id, "Socket disconnected");
}

fn truncate_for_log(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
