//! `WebSocket` handler for real-time event streaming.
//!
//! Clients connect to `GET /ws/events` and receive every event as a JSON
//! text frame once it is stored. `?process_ref=<uuid>` limits the stream
//! to one process.
//!
//! If a client falls behind, lagged events are skipped and the client
//! resumes from the most recent one.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use retrace_types::ProcessRef;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::ObserverError;
use crate::state::AppState;

/// Query parameters for `GET /ws/events`.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Only stream events of this process.
    pub process_ref: Option<ProcessRef>,
}

/// Upgrade an HTTP request to a `WebSocket` connection and begin
/// streaming stored events.
///
/// # Route
///
/// `GET /ws/events`
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ObserverError> {
    let Query(params) = query?;
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, state, params.process_ref)))
}

/// Handle the `WebSocket` lifecycle: subscribe to the live feed and
/// forward each matching event as a text frame.
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>, filter: Option<ProcessRef>) {
    debug!(?filter, "WebSocket client connected");

    let mut rx = state.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if filter.is_some_and(|p| p != event.process_ref) {
                            continue;
                        }
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("Failed to serialize event: {e}");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket client disconnected (send failed)");
                            return;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "WebSocket client lagged, skipping ahead");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event feed closed, shutting down WebSocket");
                        return;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            debug!("WebSocket client disconnected (pong failed)");
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
