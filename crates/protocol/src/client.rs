//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{ContentKind, Priority};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },

    // Conversation
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        message_type: ContentKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: String, is_typing: bool },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        room_id: String,
        message_ids: Vec<String>,
    },

    // Room lifecycle (agent console + manual user request)
    #[serde(rename_all = "camelCase")]
    OpenHumanRoom { subject: String, priority: Priority },
    #[serde(rename_all = "camelCase")]
    AcceptRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    CloseRoom {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ListWaitingRooms,

    // Post-close feedback
    #[serde(rename_all = "camelCase")]
    SubmitRating {
        room_id: String,
        score: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}
