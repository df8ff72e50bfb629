//! Pure room lifecycle transitions
//!
//! All business logic for room status changes lives here as a pure,
//! synchronous function: `transition(room, input) -> (room, effects)`.
//! No IO, no async, no locking — fully unit-testable. An illegal
//! transition returns `InvalidTransition` and mutates nothing.

use concierge_protocol::{Room, RoomKind, RoomStatus, ServerMessage};
use thiserror::Error;

/// Rejected room status changes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition: {op} from {from:?}")]
    InvalidTransition { op: &'static str, from: RoomStatus },
}

// ---------------------------------------------------------------------------
// Input — one variant per lifecycle operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// An agent claims a waiting human room
    Accept {
        agent_id: String,
        agent_name: Option<String>,
    },

    /// Close the room. Legal from `waiting` or `active`.
    Close { message: Option<String> },

    /// Retire an AI room at the end of a transfer. Internal — not
    /// reachable from any client operation.
    Retire,
}

// ---------------------------------------------------------------------------
// Effects — describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Effect {
    Persist(PersistOp),
    Emit(ServerMessage),
}

#[derive(Debug)]
pub enum PersistOp {
    RoomUpdate {
        id: String,
        status: Option<RoomStatus>,
        agent_id: Option<String>,
        agent_name: Option<String>,
        closed_at: Option<i64>,
    },
}

impl PersistOp {
    /// Convert to the PersistCommand used by the persistence layer
    pub fn into_persist_command(self) -> crate::persistence::PersistCommand {
        use crate::persistence::PersistCommand;
        match self {
            PersistOp::RoomUpdate {
                id,
                status,
                agent_id,
                agent_name,
                closed_at,
            } => PersistCommand::RoomUpdate {
                id,
                status,
                agent_id,
                agent_name,
                closed_at,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// transition() — the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous lifecycle transition.
///
/// Given the current room and an input, returns the new room and a list
/// of effects (persistence writes, broadcasts) to execute. On error the
/// original room is untouched (the caller keeps its copy).
pub fn transition(
    mut room: Room,
    input: Input,
    now_ms: i64,
) -> Result<(Room, Vec<Effect>), LifecycleError> {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::Accept {
            agent_id,
            agent_name,
        } => {
            if room.status != RoomStatus::Waiting {
                return Err(LifecycleError::InvalidTransition {
                    op: "accept",
                    from: room.status,
                });
            }

            room.status = RoomStatus::Active;
            room.agent_id = Some(agent_id.clone());
            room.agent_name = agent_name.clone();

            effects.push(Effect::Persist(PersistOp::RoomUpdate {
                id: room.id.clone(),
                status: Some(RoomStatus::Active),
                agent_id: Some(agent_id.clone()),
                agent_name: agent_name.clone(),
                closed_at: None,
            }));
            effects.push(Effect::Emit(ServerMessage::RoomAccepted {
                room_id: room.id.clone(),
                agent_id,
                agent_name,
            }));
        }

        Input::Close { message } => {
            if !matches!(room.status, RoomStatus::Waiting | RoomStatus::Active) {
                return Err(LifecycleError::InvalidTransition {
                    op: "close",
                    from: room.status,
                });
            }

            room.status = RoomStatus::Closed;
            room.closed_at = Some(now_ms);

            effects.push(Effect::Persist(PersistOp::RoomUpdate {
                id: room.id.clone(),
                status: Some(RoomStatus::Closed),
                agent_id: None,
                agent_name: None,
                closed_at: Some(now_ms),
            }));
            effects.push(Effect::Emit(ServerMessage::RoomClosed {
                room_id: room.id.clone(),
                closed_at: now_ms,
                message,
                agent_name: room.agent_name.clone(),
            }));
        }

        Input::Retire => {
            if room.kind != RoomKind::Ai || room.status != RoomStatus::AiActive {
                return Err(LifecycleError::InvalidTransition {
                    op: "retire",
                    from: room.status,
                });
            }

            room.status = RoomStatus::Closed;
            room.closed_at = Some(now_ms);

            effects.push(Effect::Persist(PersistOp::RoomUpdate {
                id: room.id.clone(),
                status: Some(RoomStatus::Closed),
                agent_id: None,
                agent_name: None,
                closed_at: Some(now_ms),
            }));
            effects.push(Effect::Emit(ServerMessage::RoomClosed {
                room_id: room.id.clone(),
                closed_at: now_ms,
                message: None,
                agent_name: None,
            }));
        }
    }

    Ok((room, effects))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
