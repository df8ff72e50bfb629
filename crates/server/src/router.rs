//! Per-session event routing.
//!
//! Each WebSocket connection owns a `SessionSubscriptions`: one
//! forwarder task per joined room, draining the room's broadcast
//! channel into the connection's outbound queue. Leaving a room (or
//! dropping the whole set on disconnect) aborts the forwarder — room
//! state is never touched by transport teardown.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use concierge_protocol::ServerMessage;

/// Tracks the forwarder task for every room this session has joined
pub struct SessionSubscriptions {
    user_id: String,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl SessionSubscriptions {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            forwarders: HashMap::new(),
        }
    }

    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.forwarders.contains_key(room_id)
    }

    /// Wire a room's event stream into this session's outbound queue.
    /// Re-joining a room replaces the previous forwarder.
    pub fn subscribe(
        &mut self,
        room_id: String,
        rx: broadcast::Receiver<ServerMessage>,
        outbound_tx: mpsc::Sender<ServerMessage>,
    ) {
        let task = spawn_forwarder(
            rx,
            outbound_tx,
            self.user_id.clone(),
            Some(room_id.clone()),
        );
        if let Some(old) = self.forwarders.insert(room_id, task) {
            old.abort();
        }
    }

    /// Wire a non-room stream (the agent waiting queue) into the
    /// session. Keyed like a room so leave/disconnect tear it down.
    pub fn subscribe_stream(
        &mut self,
        key: String,
        rx: broadcast::Receiver<ServerMessage>,
        outbound_tx: mpsc::Sender<ServerMessage>,
    ) {
        let task = spawn_forwarder(rx, outbound_tx, self.user_id.clone(), None);
        if let Some(old) = self.forwarders.insert(key, task) {
            old.abort();
        }
    }

    pub fn unsubscribe(&mut self, room_id: &str) {
        if let Some(task) = self.forwarders.remove(room_id) {
            task.abort();
        }
    }

    /// Best-effort teardown on disconnect
    pub fn clear(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }
}

impl Drop for SessionSubscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Spawn a task that drains a broadcast receiver and forwards events to
/// the session's outbound channel. When the outbound channel closes
/// (client disconnected), the task exits and the Receiver is dropped —
/// automatic cleanup, no manual unsubscribe needed.
///
/// Typing echoes are filtered here: a session never receives its own
/// `user_typing` events. If the subscriber lags behind the broadcast
/// buffer, a `lagged` error is sent so the client can re-join for a
/// fresh history load.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<ServerMessage>,
    own_user_id: String,
    room_id: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if let ServerMessage::UserTyping { user_id, .. } = &msg {
                        if user_id == &own_user_id {
                            continue;
                        }
                    }
                    if outbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "router",
                        event = "router.forwarder.lagged",
                        room_id = ?room_id,
                        skipped = n,
                        "Subscriber lagged, skipped {n} events"
                    );
                    let _ = outbound_tx
                        .send(ServerMessage::Error {
                            code: "lagged".to_string(),
                            message: format!("Subscriber lagged, skipped {n} events"),
                            room_id: room_id.clone(),
                        })
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
