use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use parley_bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Invalid(String),

    #[error("conversation {0} not found")]
    NotFound(Uuid),

    #[error("user {user_id} is not a member of conversation {conversation_id}")]
    NotAMember { user_id: Uuid, conversation_id: Uuid },

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("distribution failure: {0}")]
    Distribution(#[from] BusError),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Invalid(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::NotAMember { .. } => (StatusCode::FORBIDDEN, "NOT_A_MEMBER"),
            Self::Persistence(e) => {
                error!("Persistence failure: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_FAILURE")
            }
            Self::Distribution(e) => {
                error!("Distribution failure: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "DISTRIBUTION_FAILURE")
            }
        };

        let message = match &self {
            Self::Persistence(_) => "failed to store request".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
