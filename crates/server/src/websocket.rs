use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use conclave_core::events::Subscription;
use conclave_core::types::RunId;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{parse_run_id, ApiResult};
use crate::config::AppState;

/// Frames sent to the client besides run events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Subscribed { run_id: RunId },
    Error { message: String },
}

/// Stream a run's events over a WebSocket.
///
/// The client first receives the run's snapshot (status, outputs so far,
/// any open approval request) and then live events until the run finishes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Response> {
    let run_id = parse_run_id(&run_id)?;
    let subscription = state.runner.subscribe(run_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, run_id, subscription)))
}

fn frame<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to encode WebSocket frame: {}", e);
            None
        }
    }
}

/// Notice for a client whose stream ended before the run's terminal event,
/// for example because the run was evicted mid-stream
fn stream_end_notice(run_id: RunId, finished: bool) -> Option<WsMessage> {
    (!finished).then(|| WsMessage::Error {
        message: format!("event stream for run {} closed before the run finished", run_id),
    })
}

async fn handle_socket(socket: WebSocket, run_id: RunId, mut subscription: Subscription) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Some(msg) = frame(&WsMessage::Subscribed { run_id }) {
        if ws_tx.send(msg).await.is_err() {
            return;
        }
    }
    tracing::info!("Client subscribed to run {}", run_id);

    let mut finished = false;
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    break;
                };
                finished = event.is_terminal();
                let Some(msg) = frame(&event) else {
                    continue;
                };
                if ws_tx.send(msg).await.is_err() {
                    tracing::debug!("Client for run {} went away", run_id);
                    return;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket connection closed for run {}", run_id);
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(notice) = stream_end_notice(run_id, finished) {
        tracing::warn!("Event stream for run {} closed early", run_id);
        if let Some(msg) = frame(&notice) {
            let _ = ws_tx.send(msg).await;
        }
    }

    // Stream is finished once the run completes or fails
    let _ = ws_tx.send(Message::Close(None)).await;
    tracing::info!("WebSocket stream for run {} finished", run_id);
}
