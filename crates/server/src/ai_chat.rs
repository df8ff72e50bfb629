//! AI chat HTTP path.
//!
//! `POST /ai-chat/messages` is request/response, not the event bus: the
//! user message goes into the AI room, the model is consulted (unless a
//! transfer keyword short-circuits it), and the reply — plus the human
//! room, when a handoff fires — comes back synchronously so the client
//! can immediately re-subscribe.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use concierge_protocol::{Room, SenderKind, TransferTrigger};
use concierge_responder::{AiReply, AiResponder, SpecialAction};

use crate::room::MessageDraft;
use crate::room_command::{PublishError, PublishOutcome};
use crate::state::RoomRegistry;
use crate::transfer::{self, TransferError};

/// Reply text when a handoff was executed
const TRANSFER_ACK_TEXT: &str = "好的，正在為您轉接真人客服，請稍候。";

/// User-facing text for a terminal transfer failure
const TRANSFER_FAILED_TEXT: &str = "轉接失敗，請稍後再試。";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiChatRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiChatResponse {
    pub room_id: String,
    pub ai_response: String,
    pub should_transfer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_action: Option<SpecialAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_service_room: Option<Room>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_error: Option<String>,
}

/// Typed HTTP error
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Identity arrives as an opaque claim issued upstream.
fn user_id_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "missing_identity",
                "x-user-id header is required",
            )
        })
}

/// POST /ai-chat/messages
pub async fn ai_chat_handler(
    State(registry): State<Arc<RoomRegistry>>,
    headers: HeaderMap,
    Json(request): Json<AiChatRequest>,
) -> Result<Json<AiChatResponse>, ApiError> {
    let user_id = user_id_from_headers(&headers)?;

    // Auto-create (or rejoin) the user's open AI room. A stale roomId in
    // the request cannot resurrect a retired room.
    let (room, actor) = registry.ensure_ai_room(&user_id).await;
    if let Some(requested) = &request.room_id {
        if requested != &room.id {
            warn!(
                component = "ai_chat",
                event = "ai_chat.room_mismatch",
                requested = %requested,
                current = %room.id,
                "Requested AI room is not the user's open room"
            );
        }
    }

    // Publish the user's message first so it lands inside the transfer
    // window if a handoff fires.
    let outcome = actor
        .publish(MessageDraft::text(
            SenderKind::User,
            Some(user_id.clone()),
            request.message.clone(),
        ))
        .await
        .map_err(|e| match e {
            PublishError::RoomClosed => ApiError::new(
                StatusCode::CONFLICT,
                "room_closed",
                "the AI room is closed; open a new conversation",
            ),
            PublishError::PersistFailed | PublishError::ActorGone => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "publish_failed",
                "message could not be recorded",
            ),
        })?;

    if let PublishOutcome::Queued(notify) = outcome {
        // A transfer was already in flight; the message follows the
        // conversation into the human room once it lands.
        return match notify.await {
            Ok(Some(human_room)) => Ok(Json(AiChatResponse {
                room_id: room.id,
                ai_response: TRANSFER_ACK_TEXT.to_string(),
                should_transfer: true,
                special_action: None,
                customer_service_room: Some(human_room),
                transfer_error: None,
            })),
            _ => Ok(Json(AiChatResponse {
                room_id: room.id,
                ai_response: AiReply::fallback().text,
                should_transfer: false,
                special_action: None,
                customer_service_room: None,
                transfer_error: None,
            })),
        };
    }

    // Explicit keyword: hand off without consulting the model at all,
    // so an unavailable adapter can never mask a human request.
    if transfer::contains_transfer_keyword(&request.message) {
        return match transfer::execute_transfer(&registry, &room.id, TransferTrigger::Keyword).await
        {
            Ok(handoff) => Ok(Json(AiChatResponse {
                room_id: room.id,
                ai_response: TRANSFER_ACK_TEXT.to_string(),
                should_transfer: true,
                special_action: None,
                customer_service_room: Some(handoff.room),
                transfer_error: None,
            })),
            Err(e) => {
                warn!(
                    component = "ai_chat",
                    event = "ai_chat.keyword_transfer_failed",
                    room_id = %room.id,
                    error = %e,
                    "Keyword transfer failed"
                );
                Err(ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transfer_failed",
                    TRANSFER_FAILED_TEXT,
                ))
            }
        };
    }

    // Consult the model; degrade to the fallback reply on any failure.
    let reply = match registry
        .responder()
        .respond(&room.id, &request.message)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(
                component = "ai_chat",
                event = "ai_chat.adapter_unavailable",
                room_id = %room.id,
                error = %e,
                "AI adapter unavailable, using fallback reply"
            );
            AiReply::fallback()
        }
    };

    // Publish the AI reply before any handoff so it is part of the
    // copied context.
    let mut ai_draft = MessageDraft::text(SenderKind::Ai, None, reply.text.clone());
    ai_draft.is_transfer_request = reply.suggests_transfer;
    if let Err(e) = actor.publish(ai_draft).await {
        warn!(
            component = "ai_chat",
            event = "ai_chat.reply_publish_failed",
            room_id = %room.id,
            error = %e,
            "AI reply could not be published"
        );
    }

    // Keyword was already ruled out above, so only the model's
    // suggestion can fire here.
    let mut customer_service_room = None;
    let mut transfer_error = None;
    match transfer::maybe_transfer(&registry, &room.id, &request.message, Some(&reply)).await {
        Ok(Some(handoff)) => {
            customer_service_room = Some(handoff.room);
        }
        Ok(None) => {}
        Err(TransferError::CreationFailed) => {
            transfer_error = Some(TRANSFER_FAILED_TEXT.to_string());
        }
        Err(e) => {
            // Another transfer won the race; the client will hear about
            // the human room through its AI-room subscription.
            info!(
                component = "ai_chat",
                event = "ai_chat.suggested_transfer_skipped",
                room_id = %room.id,
                error = %e,
                "Suggested transfer skipped"
            );
        }
    }

    Ok(Json(AiChatResponse {
        room_id: room.id,
        ai_response: reply.text,
        should_transfer: reply.suggests_transfer || customer_service_room.is_some(),
        special_action: reply.special_action,
        customer_service_room,
        transfer_error,
    }))
}
