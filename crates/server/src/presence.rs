//! Typing indicators.
//!
//! A typing start broadcasts to the room's other subscribers and arms a
//! 2-second expiry through the central scheduler. The expiry broadcasts
//! the stop on its own, independent of any explicit stop event — a
//! client that disconnects or drops its "stop typing" frame cannot
//! leave a stuck indicator.

use std::sync::Arc;
use std::time::Duration;

use concierge_protocol::ServerMessage;

use crate::scheduler::{TimerKey, TimerPurpose};
use crate::state::RoomRegistry;

/// Silence after which a typing indicator auto-clears
pub const TYPING_EXPIRY: Duration = Duration::from_secs(2);

fn typing_key(room_id: &str, session_id: &str) -> TimerKey {
    TimerKey {
        room_id: room_id.to_string(),
        purpose: TimerPurpose::TypingExpiry {
            session_id: session_id.to_string(),
        },
    }
}

/// Handle a typing event from a session. Repeated starts re-arm the
/// expiry (debounce); an explicit stop disarms it and broadcasts
/// immediately.
pub async fn set_typing(
    registry: &Arc<RoomRegistry>,
    room_id: &str,
    session_id: &str,
    user_id: &str,
    is_typing: bool,
) {
    let Some(actor) = registry.get_room(room_id) else {
        return;
    };

    actor
        .broadcast(ServerMessage::UserTyping {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_typing,
        })
        .await;

    let key = typing_key(room_id, session_id);
    if is_typing {
        let fire_registry = registry.clone();
        let room_id = room_id.to_string();
        let user_id = user_id.to_string();
        registry.scheduler.schedule(key, TYPING_EXPIRY, async move {
            if let Some(actor) = fire_registry.get_room(&room_id) {
                actor
                    .broadcast(ServerMessage::UserTyping {
                        room_id: room_id.clone(),
                        user_id,
                        is_typing: false,
                    })
                    .await;
            }
        });
    } else {
        registry.scheduler.cancel(&key);
    }
}
