//! Read-position reconciliation.
//!
//! A participant's read marker only ever moves forward and never past the
//! newest message someone else sent. Both rules are applied by the single
//! UPDATE in [`ChatRepository::set_last_read`]; this module owns the confirmed
//! position type and the service that notifies the room once it is known.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use chat_hub::Hub;

use crate::repository::{ChatRepository, StoreResult};
use crate::ws::events::ChatEvent;

/// Confirmed read state after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadPosition {
    pub user_id: i64,
    pub last_read_message_id: i64,
    /// Highest marker among the other participants of the chat.
    pub others_max_last_read_message_id: i64,
    /// The stored marker moved forward in this update.
    #[serde(skip)]
    pub advanced: bool,
}

/// Stored markers are nullable and legacy rows may hold negatives.
pub fn normalize_marker(stored: Option<i64>) -> i64 {
    stored.unwrap_or(0).max(0)
}

#[derive(Clone)]
pub struct ReadReconciler {
    repository: Arc<ChatRepository>,
    hub: Hub,
}

impl ReadReconciler {
    pub fn new(repository: Arc<ChatRepository>, hub: Hub) -> Self {
        Self { repository, hub }
    }

    /// Advance the marker and broadcast `message.read` to the whole room.
    ///
    /// Nothing is broadcast when the update fails. Transient store errors are
    /// returned as-is; retrying is the caller's call.
    pub async fn set_last_read(
        &self,
        chat_id: i64,
        user_id: i64,
        requested: i64,
    ) -> StoreResult<ReadPosition> {
        let position = self
            .repository
            .set_last_read(chat_id, user_id, requested)
            .await?;

        debug!(
            chat_id,
            user_id,
            requested,
            confirmed = position.last_read_message_id,
            advanced = position.advanced,
            "read marker reconciled"
        );

        match ChatEvent::message_read(chat_id, &position).encode() {
            Ok(payload) => self.hub.broadcast(chat_id, payload).await,
            Err(e) => error!(chat_id, "failed to encode message.read event: {}", e),
        }

        Ok(position)
    }
}
