//! Room actor — owns a RoomHandle and processes commands sequentially.
//!
//! Each room runs as an independent tokio task and is the unit of
//! mutual exclusion: concurrent accept/close/publish calls on the same
//! room serialize through the command queue, while different rooms
//! proceed in parallel. Lock-free room reads go through `ArcSwap`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use concierge_protocol::{Message, Room, ServerMessage};

use crate::clock::now_ms;
use crate::persistence::PersistCommand;
use crate::room::{MessageDraft, QueuedPublish, RoomHandle};
use crate::room_command::{
    PublishError, PublishOutcome, RoomCommand, RoomSubscription, TransferHoldError,
};
use crate::transition::{transition, Effect, Input, LifecycleError};

/// Handle to a running room actor (cheap to Clone).
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<RoomCommand>,
    snapshot: Arc<ArcSwap<Room>>,
}

impl RoomActorHandle {
    /// Spawn the actor task for a room, returning its handle.
    pub fn spawn(handle: RoomHandle, persist_tx: mpsc::Sender<PersistCommand>) -> RoomActorHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        let snapshot = handle.snapshot_arc();
        let id = handle.id().to_string();
        handle.refresh_snapshot();

        tokio::spawn(room_actor_loop(handle, command_rx, persist_tx));

        RoomActorHandle {
            id,
            command_tx,
            snapshot,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: RoomCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "room_actor",
                room_id = %self.id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Lock-free room snapshot.
    pub fn room(&self) -> Arc<Room> {
        self.snapshot.load_full()
    }

    // -- Typed wrappers over the command queue ------------------------------

    pub async fn subscribe(&self) -> Option<RoomSubscription> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Subscribe { reply: tx }).await;
        rx.await.ok()
    }

    pub async fn publish(&self, draft: MessageDraft) -> Result<PublishOutcome, PublishError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Publish { draft, reply: tx }).await;
        rx.await.map_err(|_| PublishError::ActorGone)?
    }

    pub async fn mark_read(&self, reader_id: String, message_ids: Vec<String>) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::MarkRead {
            reader_id,
            message_ids,
            reply: tx,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    pub async fn apply(&self, input: Input) -> Result<Room, LifecycleError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Apply { input, reply: tx }).await;
        rx.await.unwrap_or(Err(LifecycleError::InvalidTransition {
            op: "apply",
            from: self.room().status,
        }))
    }

    pub async fn begin_transfer(&self) -> Result<Vec<Message>, TransferHoldError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::BeginTransfer { reply: tx }).await;
        rx.await.unwrap_or(Err(TransferHoldError::RoomClosed))
    }

    pub async fn complete_transfer(&self) -> Result<Vec<QueuedPublish>, LifecycleError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::CompleteTransfer { reply: tx }).await;
        rx.await.unwrap_or(Err(LifecycleError::InvalidTransition {
            op: "retire",
            from: self.room().status,
        }))
    }

    pub async fn abort_transfer(&self) {
        self.send(RoomCommand::AbortTransfer).await;
    }

    pub async fn broadcast(&self, msg: ServerMessage) {
        self.send(RoomCommand::Broadcast { msg }).await;
    }
}

/// Actor loop: drain the command queue until every handle is dropped.
async fn room_actor_loop(
    mut handle: RoomHandle,
    mut command_rx: mpsc::Receiver<RoomCommand>,
    persist_tx: mpsc::Sender<PersistCommand>,
) {
    while let Some(cmd) = command_rx.recv().await {
        handle_room_command(cmd, &mut handle, &persist_tx).await;
    }
}

async fn handle_room_command(
    cmd: RoomCommand,
    handle: &mut RoomHandle,
    persist_tx: &mpsc::Sender<PersistCommand>,
) {
    match cmd {
        RoomCommand::Subscribe { reply } => {
            let _ = reply.send(RoomSubscription {
                room: handle.room().clone(),
                messages: handle.messages().to_vec(),
                rx: handle.subscribe(),
            });
        }

        RoomCommand::Publish { draft, reply } => {
            if handle.is_closed() {
                let _ = reply.send(Err(PublishError::RoomClosed));
                return;
            }

            if handle.transfer_in_flight() {
                let (notify_tx, notify_rx) = oneshot::channel();
                handle.queue_publish(QueuedPublish {
                    draft,
                    notify: notify_tx,
                });
                let _ = reply.send(Ok(PublishOutcome::Queued(notify_rx)));
                return;
            }

            let result = publish(handle, draft, persist_tx).await;
            let _ = reply.send(result.map(PublishOutcome::Delivered));
        }

        RoomCommand::MarkRead {
            reader_id,
            message_ids,
            reply,
        } => {
            let flipped = handle.mark_read(&reader_id, &message_ids);
            if !flipped.is_empty() {
                let _ = persist_tx
                    .send(PersistCommand::MessagesMarkRead {
                        room_id: handle.id().to_string(),
                        message_ids: flipped.clone(),
                    })
                    .await;
                handle.broadcast(ServerMessage::MessagesRead {
                    room_id: handle.id().to_string(),
                    message_ids: flipped.clone(),
                });
            }
            let _ = reply.send(flipped);
        }

        RoomCommand::Apply { input, reply } => {
            let _ = reply.send(apply_transition(handle, input, persist_tx).await);
        }

        RoomCommand::BeginTransfer { reply } => {
            let result = if handle.is_closed() {
                Err(TransferHoldError::RoomClosed)
            } else if handle.transfer_in_flight() {
                Err(TransferHoldError::AlreadyInFlight)
            } else {
                handle.begin_transfer();
                Ok(handle.messages().to_vec())
            };
            let _ = reply.send(result);
        }

        RoomCommand::CompleteTransfer { reply } => {
            match apply_transition(handle, Input::Retire, persist_tx).await {
                Ok(_) => {
                    let _ = reply.send(Ok(handle.end_transfer()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }

        RoomCommand::AbortTransfer => {
            for queued in handle.end_transfer() {
                let _ = queued.notify.send(None);
                if let Err(e) = publish(handle, queued.draft, persist_tx).await {
                    warn!(
                        component = "room_actor",
                        room_id = %handle.id(),
                        error = %e,
                        "Dropped queued message after transfer abort"
                    );
                }
            }
        }

        RoomCommand::Broadcast { msg } => {
            handle.broadcast(msg);
        }
    }
}

/// Write-then-notify: the message is durable (persistence flush acked)
/// before any subscriber sees it, so a session joining mid-publish can
/// always recover it from history.
async fn publish(
    handle: &mut RoomHandle,
    draft: MessageDraft,
    persist_tx: &mpsc::Sender<PersistCommand>,
) -> Result<Message, PublishError> {
    let message = handle.build_message(draft, now_ms());

    let (ack_tx, ack_rx) = oneshot::channel();
    persist_tx
        .send(PersistCommand::MessageAppend {
            message: message.clone(),
            ack: Some(ack_tx),
        })
        .await
        .map_err(|_| PublishError::PersistFailed)?;
    ack_rx.await.map_err(|_| PublishError::PersistFailed)?;

    handle.append(message.clone());
    handle.broadcast(ServerMessage::NewMessage {
        message: message.clone(),
    });
    Ok(message)
}

async fn apply_transition(
    handle: &mut RoomHandle,
    input: Input,
    persist_tx: &mpsc::Sender<PersistCommand>,
) -> Result<Room, LifecycleError> {
    let (room, effects) = transition(handle.room().clone(), input, now_ms())?;
    handle.set_room(room.clone());

    for effect in effects {
        match effect {
            Effect::Persist(op) => {
                let _ = persist_tx.send(op.into_persist_command()).await;
            }
            Effect::Emit(msg) => {
                handle.broadcast(msg);
            }
        }
    }

    Ok(room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_protocol::{Priority, RoomKind, RoomSource, RoomStatus, SenderKind};

    use crate::persistence::{create_persistence_channel, init_schema, PersistenceWriter};

    fn test_room(kind: RoomKind, status: RoomStatus) -> Room {
        Room {
            id: concierge_protocol::new_id(),
            kind,
            status,
            owner_user_id: "u-1".to_string(),
            agent_id: None,
            agent_name: None,
            subject: "測試".to_string(),
            priority: Priority::Medium,
            source: RoomSource::Direct,
            created_at: 0,
            closed_at: None,
        }
    }

    /// Actor wired to a real persistence writer on a temp database, so
    /// publish acks behave as in production.
    fn spawn_actor(room: Room) -> (RoomActorHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        init_schema(&db).unwrap();

        let (persist_tx, persist_rx) = create_persistence_channel();
        tokio::spawn(PersistenceWriter::with_db_path(persist_rx, db).run());

        let handle = RoomActorHandle::spawn(RoomHandle::new(room), persist_tx);
        (handle, dir)
    }

    fn user_draft(body: &str) -> MessageDraft {
        MessageDraft::text(SenderKind::User, Some("u-1".to_string()), body)
    }

    #[tokio::test]
    async fn publish_delivers_in_order_to_subscriber() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Ai, RoomStatus::AiActive));

        let sub = actor.subscribe().await.unwrap();
        let mut rx = sub.rx;
        assert!(sub.messages.is_empty());

        for body in ["一", "二", "三"] {
            let outcome = actor.publish(user_draft(body)).await.unwrap();
            assert!(matches!(outcome, PublishOutcome::Delivered(_)));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                ServerMessage::NewMessage { message } => seen.push(message),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        let bodies: Vec<_> = seen.iter().filter_map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["一", "二", "三"]);
        let sequences: Vec<_> = seen.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn publish_to_closed_room_is_rejected() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Human, RoomStatus::Waiting));

        actor
            .apply(Input::Close { message: None })
            .await
            .unwrap();

        let err = actor.publish(user_draft("哈囉")).await.unwrap_err();
        assert!(matches!(err, PublishError::RoomClosed));
    }

    #[tokio::test]
    async fn concurrent_accepts_serialize_one_winner() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Human, RoomStatus::Waiting));

        let a = actor.clone();
        let b = actor.clone();
        let (first, second) = tokio::join!(
            a.apply(Input::Accept {
                agent_id: "agent-1".to_string(),
                agent_name: None,
            }),
            b.apply(Input::Accept {
                agent_id: "agent-2".to_string(),
                agent_name: None,
            }),
        );

        // Exactly one wins; the other gets InvalidTransition
        assert!(first.is_ok() != second.is_ok());
        let room = actor.room();
        assert_eq!(room.status, RoomStatus::Active);
        assert!(room.agent_id.is_some());
    }

    #[tokio::test]
    async fn publishes_during_transfer_are_queued() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Ai, RoomStatus::AiActive));

        actor.publish(user_draft("第一句")).await.unwrap();
        let held = actor.begin_transfer().await.unwrap();
        assert_eq!(held.len(), 1);

        let outcome = actor.publish(user_draft("轉接中的訊息")).await.unwrap();
        let notify = match outcome {
            PublishOutcome::Queued(rx) => rx,
            other => panic!("expected queued publish, got {other:?}"),
        };

        let queued = actor.complete_transfer().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(actor.room().status, RoomStatus::Closed);

        // Coordinator resolves the notifier once the target room exists;
        // dropping it here resolves the caller with a closed channel.
        drop(queued);
        assert!(notify.await.is_err());
    }

    #[tokio::test]
    async fn abort_transfer_replays_queued_messages_locally() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Ai, RoomStatus::AiActive));

        actor.begin_transfer().await.unwrap();
        let outcome = actor.publish(user_draft("還在嗎")).await.unwrap();
        let notify = match outcome {
            PublishOutcome::Queued(rx) => rx,
            other => panic!("expected queued publish, got {other:?}"),
        };

        let sub = actor.subscribe().await.unwrap();
        let mut rx = sub.rx;

        actor.abort_transfer().await;
        assert_eq!(notify.await.unwrap(), None);

        match rx.recv().await.unwrap() {
            ServerMessage::NewMessage { message } => {
                assert_eq!(message.body.as_deref(), Some("還在嗎"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(actor.room().status, RoomStatus::AiActive);
    }

    #[tokio::test]
    async fn mark_read_broadcasts_only_flipped_ids() {
        let (actor, _dir) = spawn_actor(test_room(RoomKind::Human, RoomStatus::Active));

        let m1 = match actor.publish(user_draft("請問")).await.unwrap() {
            PublishOutcome::Delivered(m) => m,
            other => panic!("unexpected outcome: {other:?}"),
        };

        let sub = actor.subscribe().await.unwrap();
        let mut rx = sub.rx;

        let flipped = actor
            .mark_read("agent-1".to_string(), vec![m1.id.clone()])
            .await;
        assert_eq!(flipped, vec![m1.id.clone()]);

        match rx.recv().await.unwrap() {
            ServerMessage::MessagesRead { message_ids, .. } => {
                assert_eq!(message_ids, vec![m1.id.clone()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Already read: no flip, no broadcast
        let flipped = actor.mark_read("agent-1".to_string(), vec![m1.id]).await;
        assert!(flipped.is_empty());
    }
}
