use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use parley_types::api::{ListMessagesQuery, ListSeenQuery, SeenMessageRequest, SendMessageRequest};

use crate::error::PipelineError;
use crate::middleware::AuthUser;
use crate::pipeline::NewMessage;
use crate::state::AppState;

pub async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let sent = state
        .pipeline
        .send_message(NewMessage {
            conversation_id: req.conversation_id,
            sender_id: user.user_id,
            kind: req.kind,
            body: req.body,
            reply_to: req.reply_to,
            sender_user_online_id: req.user_online_id,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(sent.message)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, PipelineError> {
    let messages = state
        .pipeline
        .list_messages(user.user_id, query.conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

/// Accepted, not applied: the watermark is written by the seen consumer.
pub async fn seen_message(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<SeenMessageRequest>,
) -> Result<StatusCode, PipelineError> {
    state
        .pipeline
        .seen_message(user.user_id, req.conversation_id, req.message_id)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn list_seen(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListSeenQuery>,
) -> Result<impl IntoResponse, PipelineError> {
    let seen = state
        .pipeline
        .list_seen(user.user_id, query.conversation_id)
        .await?;
    Ok(Json(seen))
}
