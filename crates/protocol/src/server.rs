//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{Message, Room};

/// A message plus its folding classification, as served in history loads.
/// `folded` is computed with [`crate::fold::is_stale`] at load time so the
/// client reducer and the transfer copy can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub message: Message,
    pub folded: bool,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Conversation
    #[serde(rename_all = "camelCase")]
    NewMessage { message: Message },
    #[serde(rename_all = "camelCase")]
    UserTyping {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        room_id: String,
        message_ids: Vec<String>,
    },

    // Room lifecycle
    #[serde(rename_all = "camelCase")]
    RoomHistory {
        room: Room,
        messages: Vec<HistoryEntry>,
    },
    #[serde(rename_all = "camelCase")]
    RoomCreated { room: Room },
    #[serde(rename_all = "camelCase")]
    RoomAccepted {
        room_id: String,
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed {
        room_id: String,
        closed_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },

    // Handoff
    #[serde(rename_all = "camelCase")]
    TransferComplete { customer_service_room: Room },

    // Agent console
    #[serde(rename_all = "camelCase")]
    WaitingRooms { rooms: Vec<Room> },

    // Feedback
    #[serde(rename_all = "camelCase")]
    RatingRecorded { room_id: String },

    // Errors
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
}
