use axum::{
    Json,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::auth::user_cookie;
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
pub struct SignInQuery {
    user_id: i64,
    #[serde(default)]
    name: Option<String>,
}

/// Identify as `user_id`: creates the user if needed and sets the cookie.
pub async fn signin(
    State(state): State<AppState>,
    Query(query): Query<SignInQuery>,
) -> ApiResult<Response> {
    if query.user_id <= 0 {
        return Err(ApiError::InvalidIdentity);
    }

    let name = query.name.as_deref().map(str::trim).unwrap_or("");
    let user = state.repository.upsert_user(query.user_id, name).await?;
    info!(user_id = user.id, "user signed in");

    Ok((
        [(header::SET_COOKIE, user_cookie(user.id))],
        Json(serde_json::json!({ "user": user })),
    )
        .into_response())
}

/// Client-facing limits.
pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "messages": state.messages_config.as_ref() }))
}
