//! Inbound client frames and the server greeting.

use bytes::Bytes;
use serde::Deserialize;

use crate::ChatId;

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(Vec<ChatId>),
    /// Well-formed frame with a type this server does not handle.
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
#[error("malformed client frame: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    chat_ids: Vec<ChatId>,
}

/// Decode one inbound text frame.
pub fn parse_client_frame(text: &str) -> Result<ClientCommand, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    Ok(match raw.kind.as_str() {
        "subscribe" => ClientCommand::Subscribe(raw.chat_ids),
        _ => ClientCommand::Unknown(raw.kind),
    })
}

/// Liveness frame sent as soon as a connection opens.
pub fn hello_frame() -> Bytes {
    Bytes::from_static(br#"{"type":"hello","ok":true}"#)
}
