pub mod chats;
pub mod health;
pub mod messages;
pub mod uploads;
pub mod users;
pub mod websocket;

use tracing::error;

use crate::AppState;
use crate::ws::events::ChatEvent;

// Re-export all handlers for easy route registration
pub use chats::{create_chat, delete_chats, get_chat, list_chats, total_unread_count};
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use messages::{delete_message, delete_messages, get_messages, mark_read, send_message};
pub use uploads::{confirm_upload, presign_download, presign_upload};
pub use users::{get_config, signin};
pub use websocket::websocket_handler;

/// Encode `event` once and fan it out to everyone subscribed to its chat.
pub(crate) async fn publish(state: &AppState, event: ChatEvent) {
    let payload = match event.encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!(chat_id = event.chat_id, "failed to encode {} event: {}", event.kind().as_str(), e);
            return;
        }
    };
    state.hub.broadcast(event.chat_id, payload).await;
    state.metrics.event_broadcast();
}
