//! WebSocket transport endpoint.
//!
//! Clients connect to `/ws` and exchange JSON messages. The outbound side
//! is a per-connection task draining the registry's sender handle; the
//! inbound side parses [`ClientMessage`] frames and hands them to the
//! session handler. Closing either side tears the connection down and
//! deregisters it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use safestreets_core::{ClientMessage, ServerMessage};

use crate::session::SessionHandler;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Build the websocket router for merging into the host HTTP server.
pub fn router(session: Arc<SessionHandler>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(session)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<Arc<SessionHandler>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, session))
}

async fn handle_connection(socket: WebSocket, session: Arc<SessionHandler>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connection_id = session.on_connect(tx).await;
    info!(connection_id = %connection_id, "WebSocket connection opened");

    // Forward registry-delivered messages to the client; keepalive pings
    // ride the same task. Ends when the registry drops the sender (stale
    // eviction, shutdown) or the client goes away.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(message) => {
                            let json = match serde_json::to_string(&message) {
                                Ok(j) => j,
                                Err(e) => {
                                    warn!(error = %e, "Outbound message serialization failed");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_session = Arc::clone(&session);
    let recv_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => recv_session.handle(&recv_id, client_msg).await,
                    Err(e) => {
                        // Malformed frames are dropped, not fatal.
                        debug!(
                            connection_id = %recv_id,
                            error = %e,
                            "Ignoring malformed client message"
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    join_either(send_task, recv_task).await;

    session.on_disconnect(&connection_id).await;
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Wait for either side to finish, then stop the other. Without the abort
/// a stale-evicted connection's receive side would hold the socket open
/// until the client goes away on its own.
async fn join_either(
    mut a: tokio::task::JoinHandle<()>,
    mut b: tokio::task::JoinHandle<()>,
) {
    tokio::select! {
        _ = &mut a => b.abort(),
        _ = &mut b => a.abort(),
    }
}
