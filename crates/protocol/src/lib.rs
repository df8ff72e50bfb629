//! Concierge Protocol
//!
//! Shared types for communication between the Concierge support-chat
//! server and its clients. These types are serialized as JSON over
//! WebSocket; the same room/message shapes back the AI-chat HTTP path.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod fold;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{HistoryEntry, ServerMessage};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
