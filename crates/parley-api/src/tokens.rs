use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
};

use parley_types::api::PushTokenRequest;

use crate::error::PipelineError;
use crate::middleware::AuthUser;
use crate::state::AppState;

/// Registering the same token twice only refreshes it.
pub async fn register_token(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PushTokenRequest>,
) -> Result<StatusCode, PipelineError> {
    if req.token.trim().is_empty() {
        return Ok(StatusCode::BAD_REQUEST);
    }
    state
        .pipeline
        .register_push_token(user.user_id, req.token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_token(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PushTokenRequest>,
) -> Result<StatusCode, PipelineError> {
    let removed = state
        .pipeline
        .delete_push_token(user.user_id, req.token)
        .await?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}
