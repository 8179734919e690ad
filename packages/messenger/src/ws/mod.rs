//! Live client connections
//!
//! Each WebSocket gets a hub connection with its own write pump; the handler
//! task reads inbound frames and turns subscriptions into hub commands.
//! Domain events are encoded by [`events`] and fanned out by the hub.

pub mod events;
mod handler;

pub use handler::handle_chat_ws;
