//! Concierge AI Responder
//!
//! Adapter between the room orchestration and the external AI model.
//! The model itself is a remote request/response service; this crate
//! owns the narrow interface to it — request shape, reply
//! interpretation, timeouts, and the degrade-to-fallback policy. It
//! never decides *when* to call the model; that policy lives in the
//! server.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Reply text used whenever the model cannot be reached. The room must
/// keep moving even when the adapter is down.
pub const FALLBACK_TEXT: &str = "抱歉，我暫時無法回應，請稍後再試，或輸入「轉人工」聯繫真人客服。";

/// Errors that can occur in the responder adapter
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("AI request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AI request timed out after {0:?}")]
    Timeout(Duration),

    #[error("AI reply could not be parsed: {0}")]
    BadReply(#[from] serde_json::Error),
}

/// A closed set of follow-up actions the model may ask the client to
/// perform. Unrecognized wire values decode to `None` and are ignored —
/// an unknown action is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialAction {
    NavigateToPasswordChange,
    NavigateToOrders,
    NavigateToFaq,
}

impl SpecialAction {
    /// Parse a wire value, dropping anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

/// Interpreted output of one model invocation
#[derive(Debug, Clone)]
pub struct AiReply {
    pub text: String,
    pub suggests_transfer: bool,
    pub special_action: Option<SpecialAction>,
}

impl AiReply {
    /// The canned reply used when the model is unavailable.
    /// Never suggests a transfer — degraded replies must not move rooms.
    pub fn fallback() -> Self {
        Self {
            text: FALLBACK_TEXT.to_string(),
            suggests_transfer: false,
            special_action: None,
        }
    }
}

/// Interface to the external AI model
#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn respond(&self, room_id: &str, user_message: &str) -> Result<AiReply, ResponderError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelRequest<'a> {
    room_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelReply {
    #[serde(alias = "aiResponse")]
    text: String,
    #[serde(default, alias = "shouldTransfer")]
    suggests_transfer: bool,
    #[serde(default)]
    special_action: Option<String>,
}

/// Talks to the external model service over HTTP
pub struct HttpResponder {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpResponder {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl AiResponder for HttpResponder {
    async fn respond(&self, room_id: &str, user_message: &str) -> Result<AiReply, ResponderError> {
        let request = self
            .client
            .post(&self.endpoint)
            .json(&ModelRequest {
                room_id,
                message: user_message,
            })
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result?.error_for_status()?,
            Err(_) => return Err(ResponderError::Timeout(self.timeout)),
        };

        let raw = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(result) => result?,
            Err(_) => return Err(ResponderError::Timeout(self.timeout)),
        };
        let reply: ModelReply = serde_json::from_str(&raw)?;

        let special_action = reply.special_action.as_deref().and_then(|raw| {
            let parsed = SpecialAction::parse(raw);
            if parsed.is_none() {
                warn!(
                    component = "responder",
                    event = "responder.special_action.unknown",
                    action = raw,
                    "Ignoring unrecognized special action"
                );
            }
            parsed
        });

        Ok(AiReply {
            text: reply.text,
            suggests_transfer: reply.suggests_transfer,
            special_action,
        })
    }
}

// ---------------------------------------------------------------------------
// Static implementation (tests, endpoint-less deployments)
// ---------------------------------------------------------------------------

/// Returns a fixed reply for every message. Used in tests and when no
/// model endpoint is configured.
pub struct StaticResponder {
    pub text: String,
    pub suggests_transfer: bool,
    pub special_action: Option<SpecialAction>,
}

impl StaticResponder {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            suggests_transfer: false,
            special_action: None,
        }
    }

    pub fn suggesting_transfer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            suggests_transfer: true,
            special_action: None,
        }
    }
}

#[async_trait]
impl AiResponder for StaticResponder {
    async fn respond(&self, _room_id: &str, _user_message: &str) -> Result<AiReply, ResponderError> {
        Ok(AiReply {
            text: self.text.clone(),
            suggests_transfer: self.suggests_transfer,
            special_action: self.special_action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_special_action_parses() {
        assert_eq!(
            SpecialAction::parse("navigate-to-password-change"),
            Some(SpecialAction::NavigateToPasswordChange)
        );
    }

    #[test]
    fn unknown_special_action_is_ignored() {
        assert_eq!(SpecialAction::parse("launch-missiles"), None);
        assert_eq!(SpecialAction::parse(""), None);
    }

    #[test]
    fn fallback_never_suggests_transfer() {
        let reply = AiReply::fallback();
        assert!(!reply.suggests_transfer);
        assert!(reply.special_action.is_none());
        assert_eq!(reply.text, FALLBACK_TEXT);
    }

    #[test]
    fn model_reply_accepts_wire_aliases() {
        let reply: ModelReply = serde_json::from_str(
            r#"{"aiResponse": "好的", "shouldTransfer": true, "specialAction": "navigate-to-orders"}"#,
        )
        .unwrap();
        assert_eq!(reply.text, "好的");
        assert!(reply.suggests_transfer);
        assert_eq!(reply.special_action.as_deref(), Some("navigate-to-orders"));
    }

    #[tokio::test]
    async fn static_responder_echoes_configuration() {
        let responder = StaticResponder::suggesting_transfer("建議轉接真人客服");
        let reply = responder.respond("room-1", "我要退貨").await.unwrap();
        assert!(reply.suggests_transfer);
        assert_eq!(reply.text, "建議轉接真人客服");
    }
}
