//! Server → client event envelopes.
//!
//! Every event goes out as `{"type": ..., "chat_id": ..., "data": {...}}` and
//! is serialized once per broadcast, not once per recipient.

use bytes::Bytes;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};

use crate::models::Message;
use crate::reconcile::ReadPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MessageNew,
    MessageRead,
    MessagesDeleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MessageNew => "message.new",
            EventKind::MessageRead => "message.read",
            EventKind::MessagesDeleted => "messages.deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    MessageNew {
        message: Message,
    },
    MessageRead {
        user_id: i64,
        last_read_message_id: i64,
        others_max_last_read_message_id: i64,
    },
    MessagesDeleted {
        ids: Vec<i64>,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::MessageNew { .. } => EventKind::MessageNew,
            EventData::MessageRead { .. } => EventKind::MessageRead,
            EventData::MessagesDeleted { .. } => EventKind::MessagesDeleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub chat_id: i64,
    pub data: EventData,
}

impl ChatEvent {
    pub fn message_new(message: Message) -> Self {
        Self {
            chat_id: message.chat_id,
            data: EventData::MessageNew { message },
        }
    }

    pub fn message_read(chat_id: i64, position: &ReadPosition) -> Self {
        Self {
            chat_id,
            data: EventData::MessageRead {
                user_id: position.user_id,
                last_read_message_id: position.last_read_message_id,
                others_max_last_read_message_id: position.others_max_last_read_message_id,
            },
        }
    }

    pub fn messages_deleted(chat_id: i64, ids: Vec<i64>) -> Self {
        Self {
            chat_id,
            data: EventData::MessagesDeleted { ids },
        }
    }

    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }

    /// Serialize to the wire payload handed to the hub.
    pub fn encode(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

impl Serialize for ChatEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ChatEvent", 3)?;
        s.serialize_field("type", self.kind().as_str())?;
        s.serialize_field("chat_id", &self.chat_id)?;
        s.serialize_field("data", &self.data)?;
        s.end()
    }
}
