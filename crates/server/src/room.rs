//! Room state ownership
//!
//! `RoomHandle` holds one room's authoritative state: the room record,
//! its ordered transcript, the per-room sequence counter, and the
//! broadcast channel that fans events out to subscribed sessions. It is
//! owned exclusively by the room's actor task — all mutation funnels
//! through the actor's command queue.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, oneshot};

use concierge_protocol::{Attachment, Message, Room, RoomStatus, SenderKind, ServerMessage};

/// Depth of the per-room broadcast buffer. A subscriber that lags past
/// this many events gets a `lagged` notice and should re-join for a
/// fresh history load.
const ROOM_BROADCAST_CAPACITY: usize = 256;

/// Everything needed to create a Message except what the room assigns
/// (id, sequence, timestamp).
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender_kind: SenderKind,
    pub sender_id: Option<String>,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub is_transfer_request: bool,
    /// Transfer seeding preserves the source message's timestamp
    pub created_at_override: Option<i64>,
}

impl MessageDraft {
    pub fn text(sender_kind: SenderKind, sender_id: Option<String>, body: impl Into<String>) -> Self {
        Self {
            sender_kind,
            sender_id,
            body: Some(body.into()),
            attachment: None,
            is_transfer_request: false,
            created_at_override: None,
        }
    }
}

/// A publish held back while a transfer is in flight. `notify` resolves
/// with the human room once the transfer lands (or `None` if it aborts).
#[derive(Debug)]
pub struct QueuedPublish {
    pub draft: MessageDraft,
    pub notify: oneshot::Sender<Option<Room>>,
}

/// Handle to one room's state
pub struct RoomHandle {
    room: Room,
    messages: Vec<Message>,
    next_sequence: u64,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    snapshot: Arc<ArcSwap<Room>>,
    transfer_in_flight: bool,
    queued: Vec<QueuedPublish>,
}

impl RoomHandle {
    /// Create a handle for a freshly created room
    pub fn new(room: Room) -> Self {
        Self::from_parts(room, Vec::new())
    }

    /// Rebuild a handle from persisted state (startup restore)
    pub fn from_parts(room: Room, messages: Vec<Message>) -> Self {
        let next_sequence = messages.iter().map(|m| m.sequence + 1).max().unwrap_or(0);
        let (broadcast_tx, _) = broadcast::channel(ROOM_BROADCAST_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(room.clone()));
        Self {
            room,
            messages,
            next_sequence,
            broadcast_tx,
            snapshot,
            transfer_in_flight: false,
            queued: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.room.id
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_closed(&self) -> bool {
        self.room.status == RoomStatus::Closed
    }

    /// Replace the room record and publish the new snapshot
    pub fn set_room(&mut self, room: Room) {
        self.room = room;
        self.refresh_snapshot();
    }

    /// Lock-free snapshot cell shared with the actor handle
    pub fn snapshot_arc(&self) -> Arc<ArcSwap<Room>> {
        self.snapshot.clone()
    }

    pub fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(self.room.clone()));
    }

    /// Subscribe to this room's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all current subscribers. Send errors mean
    /// nobody is listening, which is fine.
    pub fn broadcast(&self, msg: ServerMessage) {
        let _ = self.broadcast_tx.send(msg);
    }

    /// Materialize a draft into the next message in this room's order
    pub fn build_message(&mut self, draft: MessageDraft, now_ms: i64) -> Message {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Message {
            id: concierge_protocol::new_id(),
            room_id: self.room.id.clone(),
            sender_kind: draft.sender_kind,
            sender_id: draft.sender_id,
            body: draft.body,
            attachment: draft.attachment,
            created_at: draft.created_at_override.unwrap_or(now_ms),
            sequence,
            read: false,
            is_transfer_request: draft.is_transfer_request,
        }
    }

    /// Append an already-persisted message to the transcript
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Flip the listed messages to read, skipping ids that are unknown,
    /// already read, or sent by the reader. Returns the ids flipped.
    pub fn mark_read(&mut self, reader_id: &str, message_ids: &[String]) -> Vec<String> {
        let mut flipped = Vec::new();
        for msg in &mut self.messages {
            if msg.read {
                continue;
            }
            if msg.sender_id.as_deref() == Some(reader_id) {
                continue;
            }
            if message_ids.iter().any(|id| id == &msg.id) {
                msg.read = true;
                flipped.push(msg.id.clone());
            }
        }
        flipped
    }

    // -- Transfer hold ------------------------------------------------------

    pub fn transfer_in_flight(&self) -> bool {
        self.transfer_in_flight
    }

    pub fn begin_transfer(&mut self) {
        self.transfer_in_flight = true;
    }

    pub fn queue_publish(&mut self, queued: QueuedPublish) {
        self.queued.push(queued);
    }

    /// End the transfer hold and hand the queued publishes back
    pub fn end_transfer(&mut self) -> Vec<QueuedPublish> {
        self.transfer_in_flight = false;
        std::mem::take(&mut self.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_protocol::{Priority, RoomKind, RoomSource};

    fn test_room() -> Room {
        Room {
            id: "room-1".to_string(),
            kind: RoomKind::Ai,
            status: RoomStatus::AiActive,
            owner_user_id: "u-1".to_string(),
            agent_id: None,
            agent_name: None,
            subject: "AI 助理".to_string(),
            priority: Priority::Medium,
            source: RoomSource::Direct,
            created_at: 0,
            closed_at: None,
        }
    }

    #[test]
    fn sequences_are_monotonic_and_resume_after_restore() {
        let mut handle = RoomHandle::new(test_room());
        let m0 = handle.build_message(
            MessageDraft::text(SenderKind::User, Some("u-1".into()), "一"),
            100,
        );
        let m1 = handle.build_message(
            MessageDraft::text(SenderKind::Ai, None, "二"),
            200,
        );
        assert_eq!((m0.sequence, m1.sequence), (0, 1));
        handle.append(m0);
        handle.append(m1);

        let mut restored = RoomHandle::from_parts(test_room(), handle.messages().to_vec());
        let m2 = restored.build_message(MessageDraft::text(SenderKind::User, None, "三"), 300);
        assert_eq!(m2.sequence, 2);
    }

    #[test]
    fn created_at_override_survives_build() {
        let mut handle = RoomHandle::new(test_room());
        let mut draft = MessageDraft::text(SenderKind::User, Some("u-1".into()), "舊訊息");
        draft.created_at_override = Some(42);
        let msg = handle.build_message(draft, 9_999);
        assert_eq!(msg.created_at, 42);
    }

    #[test]
    fn mark_read_skips_own_and_already_read() {
        let mut handle = RoomHandle::new(test_room());
        let mine = handle.build_message(
            MessageDraft::text(SenderKind::User, Some("u-1".into()), "我的"),
            100,
        );
        let theirs = handle.build_message(MessageDraft::text(SenderKind::Ai, None, "回覆"), 200);
        let mine_id = mine.id.clone();
        let theirs_id = theirs.id.clone();
        handle.append(mine);
        handle.append(theirs);

        let flipped = handle.mark_read("u-1", &[mine_id.clone(), theirs_id.clone()]);
        assert_eq!(flipped, vec![theirs_id.clone()]);

        // Second pass: nothing left to flip
        let flipped = handle.mark_read("u-1", &[mine_id, theirs_id]);
        assert!(flipped.is_empty());
    }

    #[test]
    fn end_transfer_drains_queue_and_clears_flag() {
        let mut handle = RoomHandle::new(test_room());
        handle.begin_transfer();
        assert!(handle.transfer_in_flight());

        let (tx, _rx) = oneshot::channel();
        handle.queue_publish(QueuedPublish {
            draft: MessageDraft::text(SenderKind::User, Some("u-1".into()), "還在嗎"),
            notify: tx,
        });

        let drained = handle.end_transfer();
        assert_eq!(drained.len(), 1);
        assert!(!handle.transfer_in_flight());
        assert!(handle.end_transfer().is_empty());
    }
}
