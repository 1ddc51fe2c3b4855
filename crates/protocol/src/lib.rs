//! Switchyard Protocol
//!
//! Shared types for communication between the Switchyard server and its
//! client transports (web chat, voice, chat-ops bridges).
//! These types are serialized as JSON over WebSocket.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
