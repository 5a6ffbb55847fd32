use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::state::AppState;

/// Caller of an authenticated route.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: String,
    pub user_id: Uuid,
}

/// Validate the bearer token and resolve the account to a user.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.identity.validate(bearer.token()).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    let account_id = claims.sub;
    let lookup = account_id.clone();
    let user_id = state
        .db
        .run(move |db| db.get_user_id_by_account_id(&lookup))
        .await
        .map_err(|e| {
            error!("Failed to resolve account: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthUser { account_id, user_id });
    Ok(next.run(req).await)
}
