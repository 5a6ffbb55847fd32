use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::{CreateConversationRequest, ListConversationsQuery};

use crate::error::PipelineError;
use crate::middleware::AuthUser;
use crate::state::AppState;

/// 201 with the new conversation, or 200 with the DM that already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let created = state.pipeline.create_conversation(user.user_id, req).await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(created.view)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse, PipelineError> {
    let conversations = state
        .pipeline
        .list_conversations(user.user_id, query.before, query.limit)
        .await?;
    Ok(Json(conversations))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, PipelineError> {
    let conversation = state
        .pipeline
        .get_conversation(user.user_id, conversation_id)
        .await?;
    Ok(Json(conversation))
}
