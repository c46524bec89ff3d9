// handler/ws.rs
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query,
    },
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::{
    dtos::chatdtos::{ClientFrame, ServerFrame, StreamQuery},
    error::HttpError,
    middleware::{AuthAccount, JWTAuthMiddeware},
    models::chatmodels::{Message, MessageType},
    service::chat_service::MAX_PAGE_SIZE,
    AppState,
};

pub fn ws_handler() -> Router {
    Router::new().route("/conversations/:conversation_id", get(conversation_stream))
}

pub async fn conversation_stream(
    ws: WebSocketUpgrade,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, HttpError> {
    // Reject outsiders before upgrading.
    app_state
        .chat_service
        .get_conversation(conversation_id, auth.account.id)
        .await?;

    let after = query.after.unwrap_or(0).max(0);
    Ok(ws.on_upgrade(move |socket| {
        run_session(socket, app_state, auth.account, conversation_id, after)
    }))
}

/// Why a session ended.
enum SessionExit {
    ClientClosed,
    SendFailed,
    Store(String),
}

async fn run_session(
    socket: WebSocket,
    app_state: Arc<AppState>,
    account: AuthAccount,
    conversation_id: Uuid,
    after: i64,
) {
    let (mut write, mut read) = socket.split();

    // Subscribe before replaying so nothing appended in between is lost.
    let mut live = app_state.chat_service.subscribe(conversation_id);
    let mut cursor = after;

    tracing::info!(
        conversation_id = %conversation_id,
        account_id = %account.id,
        after,
        "Conversation stream opened"
    );

    let exit = match catch_up(&app_state, &mut write, conversation_id, account.id, &mut cursor).await {
        Err(exit) => exit,
        Ok(()) => loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => break SessionExit::ClientClosed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(conversation_id = %conversation_id, error = %e, "WebSocket read error");
                            break SessionExit::ClientClosed;
                        }
                    };

                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) if frame.frame_type == MessageType::Text => {
                            // The append is published back to every subscriber, this one included.
                            if let Err(e) = app_state
                                .chat_service
                                .append_text(conversation_id, account.id, &account.name, &frame.message)
                                .await
                            {
                                tracing::warn!(conversation_id = %conversation_id, error = %e, "Inbound frame rejected");
                            }
                        }
                        Ok(_) => {
                            tracing::warn!(conversation_id = %conversation_id, "Clients cannot send system frames");
                        }
                        Err(e) => {
                            tracing::warn!(conversation_id = %conversation_id, error = %e, "Malformed client frame");
                        }
                    }
                }
                published = live.recv() => {
                    match published {
                        Ok(message) => {
                            if message.sequence <= cursor {
                                continue;
                            }
                            if !send_frame(&mut write, &message).await {
                                break SessionExit::SendFailed;
                            }
                            cursor = message.sequence;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(conversation_id = %conversation_id, skipped, "Subscriber lagged, replaying from store");
                            if let Err(exit) = catch_up(&app_state, &mut write, conversation_id, account.id, &mut cursor).await {
                                break exit;
                            }
                        }
                        Err(RecvError::Closed) => break SessionExit::ClientClosed,
                    }
                }
            }
        },
    };

    drop(live);
    app_state.chat_service.release(conversation_id);

    match exit {
        SessionExit::ClientClosed => {
            tracing::info!(conversation_id = %conversation_id, account_id = %account.id, "Conversation stream closed");
        }
        SessionExit::SendFailed => {
            tracing::debug!(conversation_id = %conversation_id, "Peer went away mid-send");
        }
        SessionExit::Store(e) => {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Conversation stream aborted");
            let _ = write.send(WsMessage::Close(None)).await;
        }
    }
}

/// Sends every stored message after `cursor`, page by page.
async fn catch_up(
    app_state: &AppState,
    write: &mut SplitSink<WebSocket, WsMessage>,
    conversation_id: Uuid,
    account_id: Uuid,
    cursor: &mut i64,
) -> Result<(), SessionExit> {
    loop {
        let page = app_state
            .chat_service
            .get_messages(conversation_id, account_id, *cursor, Some(MAX_PAGE_SIZE))
            .await
            .map_err(|e| SessionExit::Store(e.to_string()))?;

        let full = page.len() as i64 == MAX_PAGE_SIZE;
        for message in &page {
            if !send_frame(write, message).await {
                return Err(SessionExit::SendFailed);
            }
            *cursor = message.sequence;
        }

        if !full {
            return Ok(());
        }
    }
}

async fn send_frame(write: &mut SplitSink<WebSocket, WsMessage>, message: &Message) -> bool {
    let frame = match serde_json::to_string(&ServerFrame::from(message)) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(message_id = %message.id, error = %e, "Failed to encode server frame");
            return true;
        }
    };

    write.send(WsMessage::Text(frame)).await.is_ok()
}
