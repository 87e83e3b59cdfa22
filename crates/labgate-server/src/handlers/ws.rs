//! Session WebSocket transport.
//!
//! A connected client keeps its session alive simply by talking: every
//! inbound frame counts as a heartbeat. Lock events that concern the session
//! (promotion out of a queue, expiry, force release) are pushed as JSON text
//! frames. When the socket closes the session id goes to the disconnect hook,
//! which ends the session once its last connection is gone.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use labgate_core::SessionId;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /sessions/{id}/connect`
pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::from(session_id);
    state.service.touch_session(&session_id)?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, session_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: SessionId) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let open = state.disconnect_hook.attach(&session_id);
    tracing::info!(conn_id = %conn_id, session_id = %session_id, open, "session transport connected");

    let mut events = state.service.subscribe();
    let (mut sink, mut stream) = socket.split();

    // Sender task: forward this session's lock events to the socket.
    let sender_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session_id = %sender_session, skipped, "lock event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !event.involves(&sender_session) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode lock event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Receiver loop: any frame is a heartbeat.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                if let Err(e) = state.service.heartbeat(&session_id) {
                    tracing::info!(session_id = %session_id, error = %e, "heartbeat rejected, closing");
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    send_task.abort();
    state.disconnect_hook.notify(session_id.clone());
    tracing::info!(conn_id = %conn_id, session_id = %session_id, "session transport disconnected");
}
