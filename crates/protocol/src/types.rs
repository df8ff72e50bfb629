//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Which side of the handoff a room belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Ai,
    Human,
}

/// Room status
///
/// `Closed` is terminal — continuing a conversation requires a new room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    AiActive,
    Waiting,
    Active,
    Closed,
}

/// Queue priority for human rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// How a human room came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomSource {
    Direct,
    AiTransfer,
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Agent,
    Ai,
    System,
}

/// Wire content type for `send_message`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
}

/// One support conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    pub status: RoomStatus,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub subject: String,
    pub priority: Priority,
    pub source: RoomSource,
    /// Unix milliseconds
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
}

/// Uploaded-image reference; the object store itself is external
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// One unit of conversation content.
///
/// Append-only within a room; `(created_at, sequence)` is the delivery
/// order and is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_kind: SenderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Unix milliseconds
    pub created_at: i64,
    /// Monotonic per room, assigned by the room actor
    pub sequence: u64,
    pub read: bool,
    /// Set on AI messages that asked for a human handoff
    #[serde(default)]
    pub is_transfer_request: bool,
}

/// What triggered an AI→human handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferTrigger {
    Keyword,
    AiSuggestion,
}

/// Record of one AI→human handoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub id: String,
    pub source_room_id: String,
    pub target_room_id: String,
    pub triggered_by: TransferTrigger,
    /// Unix milliseconds, `window_end - FRESH_WINDOW_MS`
    pub window_start: i64,
    /// Unix milliseconds, the transfer moment
    pub window_end: i64,
    /// Ordered ids of the source-room messages copied into the target
    pub copied_message_ids: Vec<String>,
}

/// Post-close satisfaction capture, at most one per human room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub room_id: String,
    pub score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub submitted_at: i64,
}

/// Identity claim a session presents on connect. Issued and validated
/// upstream; the server treats it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    User,
    Agent,
}
