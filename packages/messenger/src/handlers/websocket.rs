use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::auth::CurrentUser;
use crate::ws;

/// Upgrade to the live event stream. The `user_id` cookie is checked before
/// the upgrade, so anonymous clients get a plain 401.
pub async fn websocket_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_chat_ws(socket, user.id(), state))
}
