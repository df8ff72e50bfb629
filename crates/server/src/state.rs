//! Application state
//!
//! `RoomRegistry` owns every live room actor plus the per-user indexes
//! that enforce the one-open-room-per-kind invariant. It is built once
//! in `main` and injected into every handler — no ambient globals.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use concierge_protocol::{
    Message, Priority, Room, RoomKind, RoomSource, RoomStatus, ServerMessage,
};
use concierge_responder::AiResponder;

use crate::clock::now_ms;
use crate::persistence::PersistCommand;
use crate::room::RoomHandle;
use crate::room_actor::RoomActorHandle;
use crate::scheduler::TimerScheduler;
use crate::transition::{Input, LifecycleError};

/// Subject line given to auto-created AI rooms
const AI_ROOM_SUBJECT: &str = "AI 客服助理";

/// Depth of the agent-console broadcast buffer
const WAITING_BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RoomOpError {
    #[error("room not found")]
    NotFound,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Error)]
pub enum CreateRoomError {
    #[error("user already has an open {kind:?} room: {existing_id}")]
    ActiveRoomExists { kind: RoomKind, existing_id: String },
}

/// Shared application state
pub struct RoomRegistry {
    /// Live room actors, open and recently closed
    rooms: DashMap<String, RoomActorHandle>,

    /// Per-user open-room indexes (the ≤1 invariant lives here)
    ai_room_by_user: DashMap<String, String>,
    human_room_by_user: DashMap<String, String>,

    /// Waiting-queue pushes for agent consoles
    waiting_tx: broadcast::Sender<ServerMessage>,

    /// Persistence channel
    persist_tx: mpsc::Sender<PersistCommand>,

    /// Database file, for synchronous read paths (ratings, restore)
    db_path: PathBuf,

    /// Centralized cancel-and-reschedule timers
    pub scheduler: TimerScheduler,

    /// External AI model adapter
    responder: Arc<dyn AiResponder>,
}

impl RoomRegistry {
    pub fn new(
        persist_tx: mpsc::Sender<PersistCommand>,
        db_path: PathBuf,
        responder: Arc<dyn AiResponder>,
    ) -> Self {
        let (waiting_tx, _) = broadcast::channel(WAITING_BROADCAST_CAPACITY);
        Self {
            rooms: DashMap::new(),
            ai_room_by_user: DashMap::new(),
            human_room_by_user: DashMap::new(),
            waiting_tx,
            persist_tx,
            db_path,
            scheduler: TimerScheduler::new(),
            responder,
        }
    }

    /// Get persistence sender
    pub fn persist(&self) -> &mpsc::Sender<PersistCommand> {
        &self.persist_tx
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone()
    }

    pub fn responder(&self) -> Arc<dyn AiResponder> {
        self.responder.clone()
    }

    /// Get a room actor handle
    pub fn get_room(&self, id: &str) -> Option<RoomActorHandle> {
        self.rooms.get(id).map(|h| h.clone())
    }

    /// Re-register a persisted room on startup
    pub fn restore(&self, room: Room, messages: Vec<Message>) {
        let user = room.owner_user_id.clone();
        let kind = room.kind;
        let status = room.status;
        let id = room.id.clone();

        let actor = RoomActorHandle::spawn(RoomHandle::from_parts(room, messages), self.persist_tx.clone());
        self.rooms.insert(id.clone(), actor);

        if status != RoomStatus::Closed {
            match kind {
                RoomKind::Ai => self.ai_room_by_user.insert(user, id),
                RoomKind::Human => self.human_room_by_user.insert(user, id),
            };
        }
    }

    fn spawn_room(&self, room: Room) -> RoomActorHandle {
        let id = room.id.clone();
        let actor = RoomActorHandle::spawn(RoomHandle::new(room), self.persist_tx.clone());
        self.rooms.insert(id, actor.clone());
        actor
    }

    fn index_entry_is_live(&self, room_id: &str) -> Option<RoomActorHandle> {
        self.get_room(room_id)
            .filter(|h| h.room().status != RoomStatus::Closed)
    }

    /// Get the user's open AI room, creating one if needed. Idempotent:
    /// a second call while the room is open returns the same room.
    pub async fn ensure_ai_room(&self, user_id: &str) -> (Room, RoomActorHandle) {
        let mut created: Option<Room> = None;

        let actor = match self.ai_room_by_user.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => match self.index_entry_is_live(occupied.get()) {
                Some(actor) => actor,
                None => {
                    let room = new_ai_room(user_id);
                    occupied.insert(room.id.clone());
                    created = Some(room.clone());
                    self.spawn_room(room)
                }
            },
            Entry::Vacant(vacant) => {
                let room = new_ai_room(user_id);
                vacant.insert(room.id.clone());
                created = Some(room.clone());
                self.spawn_room(room)
            }
        };

        if let Some(room) = created {
            info!(
                component = "lifecycle",
                event = "room.created",
                room_id = %room.id,
                kind = "ai",
                user_id = %user_id,
                "AI room created"
            );
            let _ = self
                .persist_tx
                .send(PersistCommand::RoomCreate { room })
                .await;
        }

        let room = actor.room().as_ref().clone();
        (room, actor)
    }

    /// Create a human room for the user. At most one open human room per
    /// user; a second request is rejected with the existing id.
    pub async fn create_human_room(
        &self,
        user_id: &str,
        subject: String,
        priority: Priority,
        source: RoomSource,
    ) -> Result<(Room, RoomActorHandle), CreateRoomError> {
        let room = Room {
            id: concierge_protocol::new_id(),
            kind: RoomKind::Human,
            status: RoomStatus::Waiting,
            owner_user_id: user_id.to_string(),
            agent_id: None,
            agent_name: None,
            subject,
            priority,
            source,
            created_at: now_ms(),
            closed_at: None,
        };

        let actor = match self.human_room_by_user.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(existing) = self.index_entry_is_live(occupied.get()) {
                    return Err(CreateRoomError::ActiveRoomExists {
                        kind: RoomKind::Human,
                        existing_id: existing.id.clone(),
                    });
                }
                occupied.insert(room.id.clone());
                self.spawn_room(room.clone())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(room.id.clone());
                self.spawn_room(room.clone())
            }
        };

        info!(
            component = "lifecycle",
            event = "room.created",
            room_id = %room.id,
            kind = "human",
            user_id = %user_id,
            source = ?room.source,
            "Human room created"
        );

        let _ = self
            .persist_tx
            .send(PersistCommand::RoomCreate { room: room.clone() })
            .await;

        // Push to agent consoles watching the queue
        self.broadcast_waiting(ServerMessage::RoomCreated { room: room.clone() });

        Ok((room, actor))
    }

    /// Agent claims a waiting room
    pub async fn accept_room(
        &self,
        room_id: &str,
        agent_id: String,
        agent_name: Option<String>,
    ) -> Result<Room, RoomOpError> {
        let actor = self.get_room(room_id).ok_or(RoomOpError::NotFound)?;
        let room = actor
            .apply(Input::Accept {
                agent_id: agent_id.clone(),
                agent_name: agent_name.clone(),
            })
            .await?;

        info!(
            component = "lifecycle",
            event = "room.accepted",
            room_id = %room_id,
            agent_id = %agent_id,
            "Room accepted"
        );

        self.broadcast_waiting(ServerMessage::RoomAccepted {
            room_id: room_id.to_string(),
            agent_id,
            agent_name,
        });

        Ok(room)
    }

    /// Close a room and release its per-user index slot
    pub async fn close_room(
        &self,
        room_id: &str,
        message: Option<String>,
    ) -> Result<Room, RoomOpError> {
        let actor = self.get_room(room_id).ok_or(RoomOpError::NotFound)?;
        let room = actor.apply(Input::Close { message }).await?;

        info!(
            component = "lifecycle",
            event = "room.closed",
            room_id = %room_id,
            kind = ?room.kind,
            "Room closed"
        );

        self.release_index(&room);
        Ok(room)
    }

    /// Clear the owner's open-room slot after a close or retire
    pub fn release_index(&self, room: &Room) {
        let index = match room.kind {
            RoomKind::Ai => &self.ai_room_by_user,
            RoomKind::Human => &self.human_room_by_user,
        };
        index.remove_if(&room.owner_user_id, |_, current| current == &room.id);
    }

    /// Snapshot of waiting human rooms, highest priority first
    pub fn waiting_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .rooms
            .iter()
            .map(|entry| entry.value().room().as_ref().clone())
            .filter(|room| room.status == RoomStatus::Waiting)
            .collect();
        rooms.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        rooms
    }

    /// Subscribe to waiting-queue pushes (agent consoles)
    pub fn subscribe_waiting(&self) -> broadcast::Receiver<ServerMessage> {
        self.waiting_tx.subscribe()
    }

    pub fn broadcast_waiting(&self, msg: ServerMessage) {
        let _ = self.waiting_tx.send(msg);
    }
}

fn new_ai_room(user_id: &str) -> Room {
    Room {
        id: concierge_protocol::new_id(),
        kind: RoomKind::Ai,
        status: RoomStatus::AiActive,
        owner_user_id: user_id.to_string(),
        agent_id: None,
        agent_name: None,
        subject: AI_ROOM_SUBJECT.to_string(),
        priority: Priority::Medium,
        source: RoomSource::Direct,
        created_at: now_ms(),
        closed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_responder::StaticResponder;

    use crate::persistence::{create_persistence_channel, init_schema, PersistenceWriter};

    fn test_registry() -> (Arc<RoomRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        init_schema(&db).unwrap();

        let (persist_tx, persist_rx) = create_persistence_channel();
        tokio::spawn(PersistenceWriter::with_db_path(persist_rx, db.clone()).run());

        let registry = Arc::new(RoomRegistry::new(
            persist_tx,
            db,
            Arc::new(StaticResponder::new("您好")),
        ));
        (registry, dir)
    }

    #[tokio::test]
    async fn ensure_ai_room_is_idempotent() {
        let (registry, _dir) = test_registry();

        let (first, _) = registry.ensure_ai_room("u-1").await;
        let (second, _) = registry.ensure_ai_room("u-1").await;
        assert_eq!(first.id, second.id);

        // A different user gets a different room
        let (other, _) = registry.ensure_ai_room("u-2").await;
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn second_open_human_room_is_rejected() {
        let (registry, _dir) = test_registry();

        let (room, _) = registry
            .create_human_room("u-1", "訂單".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();

        let err = registry
            .create_human_room("u-1", "另一個".into(), Priority::Low, RoomSource::Direct)
            .await
            .unwrap_err();
        match err {
            CreateRoomError::ActiveRoomExists { existing_id, .. } => {
                assert_eq!(existing_id, room.id);
            }
        }

        // Closing frees the slot
        registry.close_room(&room.id, None).await.unwrap();
        registry
            .create_human_room("u-1", "新的".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn accept_then_second_accept_fails() {
        let (registry, _dir) = test_registry();

        let (room, _) = registry
            .create_human_room("u-1", "訂單".into(), Priority::High, RoomSource::AiTransfer)
            .await
            .unwrap();

        let accepted = registry
            .accept_room(&room.id, "agent-1".into(), Some("Ann".into()))
            .await
            .unwrap();
        assert_eq!(accepted.status, RoomStatus::Active);
        assert_eq!(accepted.agent_id.as_deref(), Some("agent-1"));

        let err = registry
            .accept_room(&room.id, "agent-2".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomOpError::Lifecycle(_)));
    }

    #[tokio::test]
    async fn waiting_rooms_sort_by_priority_then_age() {
        let (registry, _dir) = test_registry();

        let (low, _) = registry
            .create_human_room("u-1", "低".into(), Priority::Low, RoomSource::Direct)
            .await
            .unwrap();
        let (high, _) = registry
            .create_human_room("u-2", "高".into(), Priority::High, RoomSource::Direct)
            .await
            .unwrap();

        let waiting = registry.waiting_rooms();
        assert_eq!(waiting.len(), 2);
        assert_eq!(waiting[0].id, high.id);
        assert_eq!(waiting[1].id, low.id);

        // Accepted rooms leave the queue
        registry
            .accept_room(&high.id, "agent-1".into(), None)
            .await
            .unwrap();
        let waiting = registry.waiting_rooms();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, low.id);
    }

    #[tokio::test]
    async fn close_room_twice_rejected() {
        let (registry, _dir) = test_registry();

        let (room, _) = registry
            .create_human_room("u-1", "訂單".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();

        registry.close_room(&room.id, None).await.unwrap();
        let err = registry.close_room(&room.id, None).await.unwrap_err();
        assert!(matches!(err, RoomOpError::Lifecycle(_)));

        let err = registry.close_room("missing", None).await.unwrap_err();
        assert!(matches!(err, RoomOpError::NotFound));
    }
}
