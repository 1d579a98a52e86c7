//! WebSocket mapping session

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use rigbridge_core::protocol::{Inbound, Reply, Session, SessionState};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn into_message(reply: Reply) -> Message {
    match reply {
        Reply::Pose(frame) => Message::Binary(frame.into()),
        Reply::Mapping(buffer) => {
            Message::Text(String::from_utf8_lossy(buffer.as_bytes()).into_owned().into())
        }
        Reply::Status(status) => Message::Text(status.into()),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // One session at a time
    let Ok(mut session) = state.session.clone().try_lock_owned() else {
        warn!("Refusing WebSocket client, a session is already active");
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: "session busy".into(),
        }));
        let _ = sender.send(close).await;
        return;
    };

    info!("WebSocket client connected");

    while let Some(msg) = receiver.next().await {
        let reply = match msg {
            Ok(Message::Text(text)) => {
                state
                    .handle_frame(&mut session, Inbound::Text(text.as_str()))
                    .await
            }
            Ok(Message::Binary(data)) => state.handle_frame(&mut session, Inbound::Binary(&data)).await,
            Ok(Message::Ping(data)) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        };

        if let Some(reply) = reply {
            if sender.send(into_message(reply)).await.is_err() {
                break;
            }
        }
    }

    // The next client starts from a fresh session
    *session = Session::new();
    *state.session_state.write().await = SessionState::Idle;
    debug!("Session reset");
    info!("WebSocket client disconnected");
}
