//! WebSocket handling
//!
//! One connection = one session. The identity claim rides the upgrade
//! query (issued and validated upstream; opaque here). Every client
//! event lands in the single typed dispatch below — there is exactly
//! one `match` over the protocol, and one outbound queue per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use concierge_protocol::fold;
use concierge_protocol::{
    Attachment, ClientMessage, ContentKind, HistoryEntry, SenderKind, ServerMessage, SessionRole,
};

use crate::clock::now_ms;
use crate::presence;
use crate::rating::{self, RatingError};
use crate::room::MessageDraft;
use crate::room_command::PublishError;
use crate::router::SessionSubscriptions;
use crate::state::{CreateRoomError, RoomOpError, RoomRegistry};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Key under which the agent waiting-queue stream is tracked
const WAITING_STREAM_KEY: &str = "waiting-queue";

/// Identity claim presented on the upgrade
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
    pub role: SessionRole,
    pub display_name: Option<String>,
}

impl SessionIdentity {
    fn from_query(query: WsQuery) -> Self {
        let role = match query.role.as_deref() {
            Some("agent") => SessionRole::Agent,
            _ => SessionRole::User,
        };
        Self {
            session_id: concierge_protocol::new_id(),
            user_id: query.user,
            role,
            display_name: query.name.filter(|n| !n.is_empty()),
        }
    }

    fn is_agent(&self) -> bool {
        self.role == SessionRole::Agent
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(registry): State<Arc<RoomRegistry>>,
) -> impl IntoResponse {
    let identity = SessionIdentity::from_query(query);
    ws.on_upgrade(move |socket| handle_socket(socket, identity, registry))
}

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, identity: SessionIdentity, registry: Arc<RoomRegistry>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id = %identity.session_id,
        user_id = %identity.user_id,
        role = ?identity.role,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);
    // Forwarders speak ServerMessage; adapt into the outbound enum
    let (event_tx, mut event_rx) = mpsc::channel::<ServerMessage>(100);
    {
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = event_rx.recv().await {
                if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                    break;
                }
            }
        });
    }

    // Spawn task to forward messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(WsFrame::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(WsFrame::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut subscriptions =
        SessionSubscriptions::new(identity.user_id.clone());

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(WsFrame::Text(text)) => text,
            Ok(WsFrame::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(WsFrame::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse client message"
                );
                send_json(
                    &event_tx,
                    ServerMessage::Error {
                        code: "parse_error".into(),
                        message: e.to_string(),
                        room_id: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(
            client_msg,
            &identity,
            &mut subscriptions,
            &event_tx,
            &registry,
            conn_id,
        )
        .await;
    }

    // Transport teardown only: forwarders die with the subscription set,
    // typing expiry timers fire on their own, room state is untouched.
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id = %identity.session_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    let _ = tx.send(msg).await;
}

async fn send_error(
    tx: &mpsc::Sender<ServerMessage>,
    code: &str,
    message: impl Into<String>,
    room_id: Option<String>,
) {
    send_json(
        tx,
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            room_id,
        },
    )
    .await;
}

fn room_op_error_code(err: &RoomOpError) -> &'static str {
    match err {
        RoomOpError::NotFound => "not_found",
        RoomOpError::Lifecycle(_) => "invalid_transition",
    }
}

/// Handle a client message — the per-session dispatch table.
pub async fn handle_client_message(
    msg: ClientMessage,
    identity: &SessionIdentity,
    subscriptions: &mut SessionSubscriptions,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    registry: &Arc<RoomRegistry>,
    conn_id: u64,
) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn_id,
        session_id = %identity.session_id,
        message = ?msg,
        "Received client message"
    );

    match msg {
        ClientMessage::JoinRoom { room_id } => {
            let Some(actor) = registry.get_room(&room_id) else {
                send_error(outbound_tx, "not_found", format!("Room {room_id} not found"), Some(room_id)).await;
                return;
            };

            let room = actor.room();
            if room.owner_user_id != identity.user_id && !identity.is_agent() {
                send_error(outbound_tx, "forbidden", "not a participant of this room", Some(room_id)).await;
                return;
            }

            let Some(subscription) = actor.subscribe().await else {
                send_error(outbound_tx, "not_found", "room is gone", Some(room_id)).await;
                return;
            };

            subscriptions.subscribe(room_id, subscription.rx, outbound_tx.clone());

            // History rides the join; folding marks share the transfer
            // window's staleness policy.
            let now = now_ms();
            let messages = subscription
                .messages
                .into_iter()
                .map(|message| HistoryEntry {
                    folded: fold::is_stale(message.created_at, now),
                    message,
                })
                .collect();
            send_json(
                outbound_tx,
                ServerMessage::RoomHistory {
                    room: subscription.room,
                    messages,
                },
            )
            .await;
        }

        ClientMessage::LeaveRoom { room_id } => {
            subscriptions.unsubscribe(&room_id);
        }

        ClientMessage::SendMessage {
            room_id,
            message,
            message_type,
            file_url,
            file_name,
        } => {
            let Some(actor) = registry.get_room(&room_id) else {
                send_error(outbound_tx, "not_found", format!("Room {room_id} not found"), Some(room_id)).await;
                return;
            };

            let room = actor.room();
            if room.owner_user_id != identity.user_id && !identity.is_agent() {
                send_error(outbound_tx, "forbidden", "not a participant of this room", Some(room_id)).await;
                return;
            }

            let attachment = match message_type {
                ContentKind::Image => match file_url {
                    Some(url) => Some(Attachment {
                        url,
                        thumbnail_url: None,
                        file_name,
                    }),
                    None => {
                        send_error(
                            outbound_tx,
                            "invalid_message",
                            "image messages require fileUrl",
                            Some(room_id),
                        )
                        .await;
                        return;
                    }
                },
                ContentKind::Text => None,
            };

            if attachment.is_none() && message.as_deref().map(str::trim).unwrap_or("").is_empty() {
                send_error(outbound_tx, "invalid_message", "empty message", Some(room_id)).await;
                return;
            }

            let sender_kind = match identity.role {
                SessionRole::Agent => SenderKind::Agent,
                SessionRole::User => SenderKind::User,
            };
            let draft = MessageDraft {
                sender_kind,
                sender_id: Some(identity.user_id.clone()),
                body: message,
                attachment,
                is_transfer_request: false,
                created_at_override: None,
            };

            if let Err(e) = actor.publish(draft).await {
                let code = match e {
                    PublishError::RoomClosed => "room_closed",
                    PublishError::PersistFailed | PublishError::ActorGone => "publish_failed",
                };
                send_error(outbound_tx, code, e.to_string(), Some(room_id)).await;
            }
            // Delivery itself arrives through the room subscription —
            // client-side pending state reconciles against `new_message`.
        }

        ClientMessage::Typing { room_id, is_typing } => {
            presence::set_typing(
                registry,
                &room_id,
                &identity.session_id,
                &identity.user_id,
                is_typing,
            )
            .await;
        }

        ClientMessage::MessageRead {
            room_id,
            message_ids,
        } => {
            if let Some(actor) = registry.get_room(&room_id) {
                // The flip set is computed in the room actor; the
                // broadcast carries only ids that actually flipped.
                actor.mark_read(identity.user_id.clone(), message_ids).await;
            }
        }

        ClientMessage::OpenHumanRoom { subject, priority } => {
            match registry
                .create_human_room(
                    &identity.user_id,
                    subject,
                    priority,
                    concierge_protocol::RoomSource::Direct,
                )
                .await
            {
                Ok((room, _)) => {
                    send_json(outbound_tx, ServerMessage::RoomCreated { room }).await;
                }
                Err(err) => {
                    let CreateRoomError::ActiveRoomExists { ref existing_id, .. } = err;
                    let existing = existing_id.clone();
                    send_error(outbound_tx, "active_room_exists", err.to_string(), Some(existing))
                        .await;
                }
            }
        }

        ClientMessage::AcceptRoom { room_id } => {
            if !identity.is_agent() {
                send_error(outbound_tx, "forbidden", "only agents accept rooms", Some(room_id))
                    .await;
                return;
            }

            match registry
                .accept_room(
                    &room_id,
                    identity.user_id.clone(),
                    identity.display_name.clone(),
                )
                .await
            {
                Ok(_) => {
                    info!(
                        component = "websocket",
                        event = "ws.room.accepted",
                        connection_id = conn_id,
                        room_id = %room_id,
                        agent_id = %identity.user_id,
                        "Room accepted"
                    );
                }
                Err(e) => {
                    send_error(outbound_tx, room_op_error_code(&e), e.to_string(), Some(room_id))
                        .await;
                }
            }
        }

        ClientMessage::CloseRoom { room_id, message } => {
            let Some(actor) = registry.get_room(&room_id) else {
                send_error(outbound_tx, "not_found", format!("Room {room_id} not found"), Some(room_id)).await;
                return;
            };
            let room = actor.room();
            if !identity.is_agent() && room.owner_user_id != identity.user_id {
                send_error(outbound_tx, "forbidden", "not a participant of this room", Some(room_id)).await;
                return;
            }

            if let Err(e) = registry.close_room(&room_id, message).await {
                send_error(outbound_tx, room_op_error_code(&e), e.to_string(), Some(room_id))
                    .await;
            }
        }

        ClientMessage::ListWaitingRooms => {
            if !identity.is_agent() {
                send_error(outbound_tx, "forbidden", "only agents list the queue", None).await;
                return;
            }

            // First listing also wires the live queue stream
            if !subscriptions.is_subscribed(WAITING_STREAM_KEY) {
                subscriptions.subscribe_stream(
                    WAITING_STREAM_KEY.to_string(),
                    registry.subscribe_waiting(),
                    outbound_tx.clone(),
                );
            }

            send_json(
                outbound_tx,
                ServerMessage::WaitingRooms {
                    rooms: registry.waiting_rooms(),
                },
            )
            .await;
        }

        ClientMessage::SubmitRating {
            room_id,
            score,
            comment,
        } => {
            match rating::record_rating(registry, &room_id, &identity.user_id, score, comment).await
            {
                Ok(_) => {
                    send_json(outbound_tx, ServerMessage::RatingRecorded { room_id }).await;
                }
                Err(e) => {
                    let code = match e {
                        RatingError::AlreadyRated => "already_rated",
                        RatingError::InvalidScore => "invalid_score",
                        RatingError::CommentTooLong => "comment_too_long",
                        RatingError::NotRatable => "not_ratable",
                        RatingError::StoreFailed => "rating_failed",
                    };
                    send_error(outbound_tx, code, e.to_string(), Some(room_id)).await;
                }
            }
        }
    }
}
