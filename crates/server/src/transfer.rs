//! Transfer coordinator — AI room → human room handoff.
//!
//! Decision policy (first match wins): an explicit keyword in the user
//! message, then the model's transfer suggestion, then nothing. The
//! handoff itself is sequenced target-room-first: create and seed the
//! human room, record the TransferEvent, and only then retire the AI
//! room — a crash mid-transfer leaves a usable waiting room rather than
//! an orphaned AI session.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use concierge_protocol::fold;
use concierge_protocol::{
    Message, Priority, Room, RoomSource, ServerMessage, TransferEvent, TransferTrigger,
};
use concierge_responder::AiReply;

use crate::clock::now_ms;
use crate::persistence::PersistCommand;
use crate::room::MessageDraft;
use crate::room_command::TransferHoldError;
use crate::state::RoomRegistry;

/// Phrases that always force a handoff, matched case-insensitively as
/// substrings of the user message.
pub const TRANSFER_KEYWORDS: [&str; 3] = ["轉人工", "人工", "真人客服"];

/// Subject line for rooms opened by a transfer
const TRANSFER_SUBJECT: &str = "轉接真人客服";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source room not found")]
    SourceNotFound,

    #[error("source room is closed")]
    SourceClosed,

    #[error("a transfer is already in flight")]
    AlreadyInFlight,

    #[error("human room could not be created")]
    CreationFailed,
}

/// A completed handoff
#[derive(Debug)]
pub struct TransferOutcome {
    pub room: Room,
    pub event: TransferEvent,
}

/// Whether `text` contains an explicit handoff request
pub fn contains_transfer_keyword(text: &str) -> bool {
    let lowered = text.to_lowercase();
    TRANSFER_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(&keyword.to_lowercase()))
}

/// Decision policy, first match wins. `adapter` is `None` when the
/// model was never consulted (keyword short-circuit) or unavailable.
pub fn decide(user_message: &str, adapter: Option<&AiReply>) -> Option<TransferTrigger> {
    if contains_transfer_keyword(user_message) {
        return Some(TransferTrigger::Keyword);
    }
    if adapter.is_some_and(|reply| reply.suggests_transfer) {
        return Some(TransferTrigger::AiSuggestion);
    }
    None
}

/// Run the decision policy and execute the handoff if it fires.
pub async fn maybe_transfer(
    registry: &Arc<RoomRegistry>,
    source_room_id: &str,
    user_message: &str,
    adapter: Option<&AiReply>,
) -> Result<Option<TransferOutcome>, TransferError> {
    match decide(user_message, adapter) {
        Some(trigger) => execute_transfer(registry, source_room_id, trigger)
            .await
            .map(Some),
        None => Ok(None),
    }
}

/// Execute the handoff from an AI room.
pub async fn execute_transfer(
    registry: &Arc<RoomRegistry>,
    source_room_id: &str,
    trigger: TransferTrigger,
) -> Result<TransferOutcome, TransferError> {
    let source = registry
        .get_room(source_room_id)
        .ok_or(TransferError::SourceNotFound)?;
    let owner = source.room().owner_user_id.clone();

    // From here on the AI room queues incoming publishes until the
    // transfer lands or aborts.
    let transcript = source.begin_transfer().await.map_err(|e| match e {
        TransferHoldError::RoomClosed => TransferError::SourceClosed,
        TransferHoldError::AlreadyInFlight => TransferError::AlreadyInFlight,
    })?;

    let window_end = now_ms();
    let window_start = fold::window_start(window_end);
    let copied: Vec<Message> = transcript
        .into_iter()
        .filter(|m| !fold::is_stale(m.created_at, window_end) && m.created_at <= window_end)
        .collect();

    // Keyword transfers are explicit user requests; queue them hotter.
    let priority = match trigger {
        TransferTrigger::Keyword => Priority::High,
        TransferTrigger::AiSuggestion => Priority::Medium,
    };

    // One retry, then surface the failure — never leave the user hanging
    // on a silently dropped request.
    let mut created = registry
        .create_human_room(&owner, TRANSFER_SUBJECT.to_string(), priority, RoomSource::AiTransfer)
        .await;
    if created.is_err() {
        warn!(
            component = "transfer",
            event = "transfer.create.retrying",
            source_room_id = %source_room_id,
            "Human room creation failed, retrying once"
        );
        created = registry
            .create_human_room(&owner, TRANSFER_SUBJECT.to_string(), priority, RoomSource::AiTransfer)
            .await;
    }

    let (target_room, target) = match created {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                component = "transfer",
                event = "transfer.create.failed",
                source_room_id = %source_room_id,
                error = %e,
                "Transfer aborted, human room could not be created"
            );
            source.abort_transfer().await;
            return Err(TransferError::CreationFailed);
        }
    };

    // Seed the windowed context, preserving timestamps and order
    let mut copied_message_ids = Vec::with_capacity(copied.len());
    for message in &copied {
        let draft = MessageDraft {
            sender_kind: message.sender_kind,
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            attachment: message.attachment.clone(),
            is_transfer_request: message.is_transfer_request,
            created_at_override: Some(message.created_at),
        };
        match target.publish(draft).await {
            Ok(_) => copied_message_ids.push(message.id.clone()),
            Err(e) => warn!(
                component = "transfer",
                event = "transfer.seed.failed",
                source_room_id = %source_room_id,
                target_room_id = %target_room.id,
                message_id = %message.id,
                error = %e,
                "Seed message dropped"
            ),
        }
    }

    let event = TransferEvent {
        id: concierge_protocol::new_id(),
        source_room_id: source_room_id.to_string(),
        target_room_id: target_room.id.clone(),
        triggered_by: trigger,
        window_start,
        window_end,
        copied_message_ids,
    };
    let _ = registry
        .persist()
        .send(PersistCommand::TransferInsert {
            event: event.clone(),
        })
        .await;

    // Tell AI-room subscribers where the conversation went, then retire
    // the source. Held publishes drain into the human room.
    source
        .broadcast(ServerMessage::TransferComplete {
            customer_service_room: target_room.clone(),
        })
        .await;

    match source.complete_transfer().await {
        Ok(queued) => {
            for held in queued {
                let _ = held.notify.send(Some(target_room.clone()));
                if let Err(e) = target.publish(held.draft).await {
                    warn!(
                        component = "transfer",
                        event = "transfer.queued_drain.failed",
                        target_room_id = %target_room.id,
                        error = %e,
                        "Queued message dropped during drain"
                    );
                }
            }
            let retired = source.room();
            registry.release_index(&retired);
        }
        Err(e) => {
            // Retire can only fail if something else closed the room in
            // the window; the human room is already live, so proceed.
            warn!(
                component = "transfer",
                event = "transfer.retire.failed",
                source_room_id = %source_room_id,
                error = %e,
                "Source room retire failed after handoff"
            );
        }
    }

    info!(
        component = "transfer",
        event = "transfer.complete",
        source_room_id = %source_room_id,
        target_room_id = %target_room.id,
        triggered_by = ?trigger,
        copied = event.copied_message_ids.len(),
        "Transfer complete"
    );

    Ok(TransferOutcome {
        room: target_room,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_protocol::{RoomKind, RoomStatus, SenderKind};
    use concierge_responder::StaticResponder;

    use crate::persistence::{create_persistence_channel, init_schema, PersistenceWriter};
    use crate::room_command::{PublishError, PublishOutcome};

    fn no_suggestion() -> AiReply {
        AiReply {
            text: "好的，我來幫您查詢".to_string(),
            suggests_transfer: false,
            special_action: None,
        }
    }

    fn suggestion() -> AiReply {
        AiReply {
            text: "建議轉接真人客服".to_string(),
            suggests_transfer: true,
            special_action: None,
        }
    }

    #[test]
    fn keyword_always_wins() {
        assert_eq!(decide("我要轉人工", None), Some(TransferTrigger::Keyword));
        assert_eq!(
            decide("我要轉人工", Some(&no_suggestion())),
            Some(TransferTrigger::Keyword)
        );
        // Keyword beats the AI suggestion in priority
        assert_eq!(
            decide("請幫我找人工客服", Some(&suggestion())),
            Some(TransferTrigger::Keyword)
        );
    }

    #[test]
    fn suggestion_fires_without_keyword() {
        assert_eq!(
            decide("幫我查訂單", Some(&suggestion())),
            Some(TransferTrigger::AiSuggestion)
        );
    }

    #[test]
    fn no_keyword_no_suggestion_no_transfer() {
        assert_eq!(decide("幫我查訂單", Some(&no_suggestion())), None);
        assert_eq!(decide("幫我查訂單", None), None);
    }

    #[test]
    fn keyword_variants_match() {
        for text in ["轉人工", "真人客服在嗎", "我想找 人工 服務"] {
            assert!(contains_transfer_keyword(text), "should match: {text}");
        }
        assert!(!contains_transfer_keyword("你好"));
    }

    // -- execute_transfer ----------------------------------------------------

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

    fn user_draft(body: &str) -> MessageDraft {
        MessageDraft::text(SenderKind::User, Some("u-1".to_string()), body)
    }

    #[tokio::test]
    async fn transfer_seeds_fresh_window_and_retires_source() {
        let (registry, _dir) = test_registry();
        let (ai_room, ai_actor) = registry.ensure_ai_room("u-1").await;

        // One stale message (4 minutes old) and two fresh ones
        let mut stale = user_draft("很久以前的問題");
        stale.created_at_override = Some(now_ms() - 240_000);
        ai_actor.publish(stale).await.unwrap();
        ai_actor.publish(user_draft("現在的問題")).await.unwrap();
        ai_actor.publish(user_draft("轉人工")).await.unwrap();

        let outcome = execute_transfer(&registry, &ai_room.id, TransferTrigger::Keyword)
            .await
            .unwrap();

        assert_eq!(outcome.room.kind, RoomKind::Human);
        assert_eq!(outcome.room.status, RoomStatus::Waiting);
        assert_eq!(outcome.room.source, RoomSource::AiTransfer);
        assert_eq!(outcome.event.triggered_by, TransferTrigger::Keyword);
        assert_eq!(outcome.event.copied_message_ids.len(), 2);
        assert_eq!(
            outcome.event.window_start,
            outcome.event.window_end - fold::FRESH_WINDOW_MS
        );

        // Seeded transcript matches the fresh window, in order
        let target = registry.get_room(&outcome.room.id).unwrap();
        let sub = target.subscribe().await.unwrap();
        let bodies: Vec<_> = sub
            .messages
            .iter()
            .filter_map(|m| m.body.clone())
            .collect();
        assert_eq!(bodies, vec!["現在的問題", "轉人工"]);

        // Source room no longer accepts messages
        assert_eq!(ai_actor.room().status, RoomStatus::Closed);
        let err = ai_actor.publish(user_draft("還在嗎")).await.unwrap_err();
        assert!(matches!(err, PublishError::RoomClosed));

        // The owner can open a fresh AI room afterwards
        let (new_ai, _) = registry.ensure_ai_room("u-1").await;
        assert_ne!(new_ai.id, ai_room.id);
    }

    #[tokio::test]
    async fn transfer_window_invariant_holds() {
        let (registry, _dir) = test_registry();
        let (ai_room, ai_actor) = registry.ensure_ai_room("u-1").await;

        for offset in [-200_000i64, -179_000, -60_000, 0] {
            let mut draft = user_draft("訊息");
            draft.created_at_override = Some(now_ms() + offset);
            ai_actor.publish(draft).await.unwrap();
        }

        let outcome = execute_transfer(&registry, &ai_room.id, TransferTrigger::AiSuggestion)
            .await
            .unwrap();

        // Every copied id maps to a message inside [end-180s, end]
        let target = registry.get_room(&outcome.room.id).unwrap();
        let seeded = target.subscribe().await.unwrap().messages;
        assert_eq!(seeded.len(), outcome.event.copied_message_ids.len());
        assert_eq!(seeded.len(), 3);
        for m in &seeded {
            assert!(m.created_at >= outcome.event.window_end - fold::FRESH_WINDOW_MS);
            assert!(m.created_at <= outcome.event.window_end);
        }
    }

    #[tokio::test]
    async fn failed_creation_aborts_and_restores_ai_room() {
        let (registry, _dir) = test_registry();
        let (ai_room, ai_actor) = registry.ensure_ai_room("u-1").await;

        // Occupy the user's human-room slot so creation fails both tries
        registry
            .create_human_room("u-1", "已存在".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();

        let err = execute_transfer(&registry, &ai_room.id, TransferTrigger::Keyword)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::CreationFailed));

        // AI room keeps working; nothing was retired
        assert_eq!(ai_actor.room().status, RoomStatus::AiActive);
        let outcome = ai_actor.publish(user_draft("你好")).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Delivered(_)));
    }

    #[tokio::test]
    async fn second_transfer_on_same_room_fails() {
        let (registry, _dir) = test_registry();
        let (ai_room, _) = registry.ensure_ai_room("u-1").await;

        execute_transfer(&registry, &ai_room.id, TransferTrigger::Keyword)
            .await
            .unwrap();

        let err = execute_transfer(&registry, &ai_room.id, TransferTrigger::Keyword)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceClosed));
    }
}
