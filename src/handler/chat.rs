// handler/chat.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{chatdtos::*, jobdtos::ApiResponse},
    error::HttpError,
    middleware::JWTAuthMiddeware,
    AppState,
};

pub fn chat_handler() -> Router {
    Router::new()
        .route("/", get(list_conversations))
        .route("/:conversation_id/messages", get(get_messages))
        .route("/:conversation_id/read", post(mark_read))
        .route("/:conversation_id/toggle-archive", post(toggle_archive))
}

pub async fn list_conversations(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Query(query): Query<ConversationQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let conversations = app_state
        .chat_service
        .list_conversations(auth.account.id, query.filter)
        .await?;

    Ok(Json(ApiResponse::success("Conversations retrieved", conversations)))
}

pub async fn get_messages(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let messages = app_state
        .chat_service
        .get_messages(
            conversation_id,
            auth.account.id,
            query.after.unwrap_or(0),
            query.limit,
        )
        .await?;

    Ok(Json(ApiResponse::success("Messages retrieved", messages)))
}

pub async fn mark_read(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(conversation_id): Path<Uuid>,
    body: Option<Json<MarkReadDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let summary = app_state
        .chat_service
        .mark_read(conversation_id, auth.account.id, body.upto_sequence)
        .await?;

    Ok(Json(ApiResponse::success("Conversation marked as read", summary)))
}

pub async fn toggle_archive(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let summary = app_state
        .chat_service
        .toggle_archive(conversation_id, auth.account.id)
        .await?;

    let message = if summary.archived {
        "Conversation archived"
    } else {
        "Conversation restored"
    };

    Ok(Json(ApiResponse::success(message, summary)))
}
