//! Commands sent to a room actor from websocket/ai-chat/transfer callers.

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use concierge_protocol::{Message, Room, ServerMessage};

use crate::room::{MessageDraft, QueuedPublish};
use crate::transition::{Input, LifecycleError};

/// What a subscriber gets back from `Subscribe`: the room, the full
/// transcript so far, and the live event stream. The transcript is
/// complete up to the moment of subscription — anything published after
/// arrives on the receiver (write-then-notify makes the seam safe).
pub struct RoomSubscription {
    pub room: Room,
    pub messages: Vec<Message>,
    pub rx: broadcast::Receiver<ServerMessage>,
}

/// Result of a publish
#[derive(Debug)]
pub enum PublishOutcome {
    /// Persisted and fanned out
    Delivered(Message),
    /// Held while a transfer is in flight; resolves with the human room
    /// once the transfer lands, or `None` if it aborted
    Queued(oneshot::Receiver<Option<Room>>),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("room is closed")]
    RoomClosed,

    #[error("message could not be durably recorded")]
    PersistFailed,

    #[error("room actor is gone")]
    ActorGone,
}

#[derive(Debug, Error)]
pub enum TransferHoldError {
    #[error("a transfer is already in flight for this room")]
    AlreadyInFlight,

    #[error("room is closed")]
    RoomClosed,
}

/// A command that can be sent to a room actor.
pub enum RoomCommand {
    // -- Queries --
    /// Subscribe to room updates with a transcript snapshot
    Subscribe {
        reply: oneshot::Sender<RoomSubscription>,
    },

    // -- Conversation --
    /// Persist a message (awaiting durability), then fan out
    Publish {
        draft: MessageDraft,
        reply: oneshot::Sender<Result<PublishOutcome, PublishError>>,
    },

    /// Flip messages to read (false→true only); broadcasts the flipped ids
    MarkRead {
        reader_id: String,
        message_ids: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },

    // -- Lifecycle --
    /// Run a lifecycle transition (accept/close/retire) and execute its
    /// effects under the room's mutual exclusion
    Apply {
        input: Input,
        reply: oneshot::Sender<Result<Room, LifecycleError>>,
    },

    // -- Transfer hold --
    /// Start holding publishes; returns the transcript for windowing
    BeginTransfer {
        reply: oneshot::Sender<Result<Vec<Message>, TransferHoldError>>,
    },

    /// Retire the room and hand back the held publishes
    CompleteTransfer {
        reply: oneshot::Sender<Result<Vec<QueuedPublish>, LifecycleError>>,
    },

    /// Cancel the hold; held publishes are delivered to this room after
    /// their notifiers resolve with `None`
    AbortTransfer,

    // -- Broadcast --
    /// Broadcast an arbitrary ServerMessage to room subscribers
    Broadcast {
        msg: ServerMessage,
    },
}
