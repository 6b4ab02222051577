//! WebSocket endpoint: per-connection frame loop with heartbeat.
//!
//! Each socket runs one `select!` loop over three sources: the hub's
//! outbound queue, inbound client frames, and the heartbeat timer. Two
//! missed pongs close the connection with 4002; a full outbound queue or a
//! stalled write drops it.

use crate::models::{ClientFrame, ServerFrame};
use crate::realtime::hub::{Registration, CLOSE_CAPACITY_EXCEEDED, CLOSE_HEARTBEAT_TIMEOUT};
use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use std::borrow::Cow;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

/// Budget for a single socket write before the connection is considered dead.
const WRITE_BUDGET: Duration = Duration::from_secs(5);

/// Consecutive unanswered pings before the connection is closed.
const MAX_MISSED_PONGS: u32 = 2;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let registration = match state.hub.register() {
        Ok(registration) => registration,
        Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CAPACITY_EXCEEDED,
                    reason: Cow::from("capacity_exceeded"),
                })))
                .await;
            return;
        }
    };

    let Registration {
        connection_id,
        client_id,
        mut outbound,
    } = registration;

    let established = ServerFrame::ConnectionEstablished {
        client_id: client_id.clone(),
        capabilities: crate::realtime::RealtimeHub::capabilities(),
        timestamp: Utc::now().timestamp(),
    };
    if send_frame(&mut socket, &established).await.is_err() {
        state.hub.unregister(connection_id);
        return;
    }

    let mut heartbeat = interval(state.hub.heartbeat_interval());
    heartbeat.tick().await; // first tick fires immediately
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            // Fan-out from the hub, FIFO per connection.
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Hub dropped us (backpressure or shutdown).
                    break;
                };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }

            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Join { room }) => {
                                let _ = state.hub.join(connection_id, &room);
                                let joined = ServerFrame::RoomJoined {
                                    room,
                                    timestamp: Utc::now().timestamp(),
                                };
                                if send_frame(&mut socket, &joined).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Leave { room }) => {
                                let _ = state.hub.leave(connection_id, &room);
                            }
                            Ok(ClientFrame::Ping) => {
                                // Client-side liveness probe; answer in kind.
                                let pong = ServerFrame::Ping {
                                    timestamp: Utc::now().timestamp(),
                                };
                                if send_frame(&mut socket, &pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Pong) => {
                                missed_pongs = 0;
                            }
                            Err(e) => {
                                debug!(connection_id, error = %e, "ignoring malformed client frame");
                            }
                        }
                    }
                    Message::Pong(_) => {
                        missed_pongs = 0;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!(connection_id, "💔 Heartbeat timeout, closing connection");
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_HEARTBEAT_TIMEOUT,
                            reason: Cow::from("heartbeat_timeout"),
                        })))
                        .await;
                    break;
                }
                missed_pongs += 1;
                let ping = ServerFrame::Ping {
                    timestamp: Utc::now().timestamp(),
                };
                if send_frame(&mut socket, &ping).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(connection_id);
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    match tokio::time::timeout(WRITE_BUDGET, socket.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => {
            debug!("socket write exceeded budget, dropping connection");
            Err(())
        }
    }
}
