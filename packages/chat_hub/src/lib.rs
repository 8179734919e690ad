//! Room-scoped fanout for live chat connections.
//!
//! A single [`Hub`] event loop owns the chat → connections membership map.
//! Producers talk to it only through its command channels, so the map needs
//! no lock. Each [`Connection`] carries a bounded outbound queue that the hub
//! fills without ever waiting and that [`run_write_pump`] drains to the
//! underlying transport.

mod connection;
mod hub;
mod protocol;
mod write_pump;

pub use connection::{Connection, ConnectionId, DEFAULT_SEND_QUEUE_CAPACITY, SendOutcome};
pub use hub::{BroadcastReport, Hub, HubConfig, HubRunner, HubStats};
pub use protocol::{ClientCommand, ProtocolError, hello_frame, parse_client_frame};
pub use write_pump::{Frame, WritePumpConfig, WritePumpError, run_write_pump};

/// Identifier of a chat room.
pub type ChatId = i64;

/// Identifier of the user owning a connection.
pub type UserId = i64;
