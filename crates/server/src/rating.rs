//! Post-close satisfaction capture.
//!
//! One rating per closed human room, submitted by the room's owner,
//! immutable once written. Skipping is a valid terminal outcome — the
//! server records nothing and never asks again.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use concierge_protocol::{Rating, RoomKind, RoomStatus};

use crate::clock::now_ms;
use crate::persistence;
use crate::state::RoomRegistry;

/// Longest accepted comment, in characters
pub const MAX_COMMENT_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum RatingError {
    #[error("room already rated")]
    AlreadyRated,

    #[error("score must be between 1 and 5")]
    InvalidScore,

    #[error("comment exceeds {MAX_COMMENT_CHARS} characters")]
    CommentTooLong,

    #[error("room is not a closed human room owned by the caller")]
    NotRatable,

    #[error("rating could not be stored")]
    StoreFailed,
}

/// Validate and record a rating for a closed human room.
pub async fn record_rating(
    registry: &Arc<RoomRegistry>,
    room_id: &str,
    user_id: &str,
    score: u8,
    comment: Option<String>,
) -> Result<Rating, RatingError> {
    if !(1..=5).contains(&score) {
        return Err(RatingError::InvalidScore);
    }
    if let Some(comment) = &comment {
        if comment.chars().count() > MAX_COMMENT_CHARS {
            return Err(RatingError::CommentTooLong);
        }
    }

    // The room may still be live in the registry or already only in the
    // database; both views are authoritative for ratability.
    let room = match registry.get_room(room_id) {
        Some(actor) => Some(actor.room().as_ref().clone()),
        None => persistence::load_room(registry.db_path(), room_id.to_string())
            .await
            .map_err(|_| RatingError::StoreFailed)?,
    };
    let Some(room) = room else {
        return Err(RatingError::NotRatable);
    };

    let ratable = room.kind == RoomKind::Human
        && room.status == RoomStatus::Closed
        && room.owner_user_id == user_id;
    if !ratable {
        return Err(RatingError::NotRatable);
    }

    let comment = comment.filter(|c| !c.is_empty());
    let rating = Rating {
        room_id: room_id.to_string(),
        score,
        comment,
        submitted_at: now_ms(),
    };

    // The primary key arbitrates concurrent submissions; the loser sees
    // AlreadyRated no matter how close the race was.
    let inserted = persistence::insert_rating(registry.db_path(), rating.clone())
        .await
        .map_err(|_| RatingError::StoreFailed)?;
    if !inserted {
        return Err(RatingError::AlreadyRated);
    }

    info!(
        component = "rating",
        event = "rating.recorded",
        room_id = %room_id,
        score = score,
        "Rating recorded"
    );

    Ok(rating)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_protocol::{Priority, RoomSource};
    use concierge_responder::StaticResponder;

    use crate::persistence::{create_persistence_channel, init_schema, PersistenceWriter};

    async fn registry_with_closed_room() -> (Arc<RoomRegistry>, String, tempfile::TempDir) {
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

        let (room, _) = registry
            .create_human_room("u-1", "訂單".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();
        registry
            .accept_room(&room.id, "agent-1".into(), Some("Ann".into()))
            .await
            .unwrap();
        registry.close_room(&room.id, None).await.unwrap();

        (registry, room.id, dir)
    }

    #[tokio::test]
    async fn rating_recorded_once_then_rejected() {
        let (registry, room_id, _dir) = registry_with_closed_room().await;

        let rating = record_rating(&registry, &room_id, "u-1", 5, Some(String::new()))
            .await
            .unwrap();
        assert_eq!(rating.score, 5);
        assert!(rating.comment.is_none());

        let err = record_rating(&registry, &room_id, "u-1", 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RatingError::AlreadyRated));
    }

    #[tokio::test]
    async fn score_bounds_are_enforced() {
        let (registry, room_id, _dir) = registry_with_closed_room().await;

        for score in [0u8, 6, 99] {
            let err = record_rating(&registry, &room_id, "u-1", score, None)
                .await
                .unwrap_err();
            assert!(matches!(err, RatingError::InvalidScore), "score {score}");
        }
    }

    #[tokio::test]
    async fn oversized_comment_is_rejected() {
        let (registry, room_id, _dir) = registry_with_closed_room().await;

        let long = "很".repeat(MAX_COMMENT_CHARS + 1);
        let err = record_rating(&registry, &room_id, "u-1", 4, Some(long))
            .await
            .unwrap_err();
        assert!(matches!(err, RatingError::CommentTooLong));

        let exactly = "好".repeat(MAX_COMMENT_CHARS);
        record_rating(&registry, &room_id, "u-1", 4, Some(exactly))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_room_and_foreign_owner_are_not_ratable() {
        let (registry, room_id, _dir) = registry_with_closed_room().await;

        // Wrong owner
        let err = record_rating(&registry, &room_id, "u-2", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RatingError::NotRatable));

        // Open human room
        let (open, _) = registry
            .create_human_room("u-3", "新問題".into(), Priority::Medium, RoomSource::Direct)
            .await
            .unwrap();
        let err = record_rating(&registry, &open.id, "u-3", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RatingError::NotRatable));

        // AI rooms are never rated
        let (ai_room, _) = registry.ensure_ai_room("u-4").await;
        let err = record_rating(&registry, &ai_room.id, "u-4", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RatingError::NotRatable));
    }
}
