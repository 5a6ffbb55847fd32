pub mod consumers;
pub mod conversations;
pub mod error;
pub mod last_message;
pub mod messages;
pub mod middleware;
pub mod pipeline;
pub mod publish;
pub mod push;
pub mod seen;
pub mod state;
pub mod tokens;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

pub use consumers::{Consumers, start_consumers};
pub use error::PipelineError;
pub use middleware::AuthUser;
pub use pipeline::{CreatedConversation, MessagePipeline, NewMessage, SentMessage};
pub use publish::{BestEffort, PublishOutcome};
pub use push::{FcmGateway, NoopGateway, PushError, PushGateway, PushNotification, PushReport};
pub use state::{AppState, AppStateInner};

/// Authenticated HTTP routes of the message pipeline.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/conversation/create", post(conversations::create_conversation))
        .route("/conversation/list", get(conversations::list_conversations))
        .route("/conversation/{conversation_id}", get(conversations::get_conversation))
        .route("/message", post(messages::send_message).get(messages::list_messages))
        .route("/seen-message", post(messages::seen_message).get(messages::list_seen))
        .route("/fcm/token", post(tokens::register_token).delete(tokens::delete_token))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
