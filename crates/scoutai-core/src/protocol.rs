// Cross-context message envelope: the one wire format shared by the popup,
// the background router and every content script.
//
// Envelopes travel as JSON text so that a content script and a background
// router from different extension versions can still talk to each other
// during an update. Unknown `type` values are rejected explicitly rather
// than ignored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ScoutError;
use crate::settings::SettingsChange;

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Browser tab identifier.
pub type TabId = u32;

/// Address of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextAddr {
    Background,
    Popup,
    Tab(TabId),
}

impl ContextAddr {
    pub fn tab_id(&self) -> Option<TabId> {
        match self {
            ContextAddr::Tab(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for ContextAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextAddr::Background => f.write_str("background"),
            ContextAddr::Popup => f.write_str("popup"),
            ContextAddr::Tab(id) => write!(f, "tab {id}"),
        }
    }
}

/// Identifies a request so its reply can be matched up in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// The closed set of recognized message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ToggleSidebar,
    RefreshRecommendations,
    ExtractDraftState,
    GetDraftState,
    ApiRequest,
    SettingsUpdated,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::ToggleSidebar,
        MessageType::RefreshRecommendations,
        MessageType::ExtractDraftState,
        MessageType::GetDraftState,
        MessageType::ApiRequest,
        MessageType::SettingsUpdated,
    ];

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ToggleSidebar => "TOGGLE_SIDEBAR",
            MessageType::RefreshRecommendations => "REFRESH_RECOMMENDATIONS",
            MessageType::ExtractDraftState => "EXTRACT_DRAFT_STATE",
            MessageType::GetDraftState => "GET_DRAFT_STATE",
            MessageType::ApiRequest => "API_REQUEST",
            MessageType::SettingsUpdated => "SETTINGS_UPDATED",
        }
    }

    /// Parse a wire name. Returns `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Whether the sender waits for a reply.
    ///
    /// Request-shaped types carry data back. Commands (`TOGGLE_SIDEBAR`,
    /// `REFRESH_RECOMMENDATIONS`) are acknowledged so the sender can tell a
    /// live receiver from a missing one. `SETTINGS_UPDATED` is fire-and-forget.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, MessageType::SettingsUpdated)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn default_method() -> String {
    "GET".to_string()
}

/// Payload of `API_REQUEST`: an outbound HTTP call performed by the
/// background context on behalf of a context without network access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequestPayload {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ApiRequestPayload {
    /// A JSON `POST` to `url`.
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        ApiRequestPayload {
            url: url.into(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }
}

/// A message together with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    ToggleSidebar,
    RefreshRecommendations,
    ExtractDraftState,
    GetDraftState,
    ApiRequest(ApiRequestPayload),
    SettingsUpdated(SettingsChange),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ToggleSidebar => MessageType::ToggleSidebar,
            Message::RefreshRecommendations => MessageType::RefreshRecommendations,
            Message::ExtractDraftState => MessageType::ExtractDraftState,
            Message::GetDraftState => MessageType::GetDraftState,
            Message::ApiRequest(_) => MessageType::ApiRequest,
            Message::SettingsUpdated(_) => MessageType::SettingsUpdated,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// `{ type, payload?, correlationId? }` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Envelope {
            message,
            correlation_id: None,
        }
    }

    pub fn with_correlation(message: Message, id: CorrelationId) -> Self {
        Envelope {
            message,
            correlation_id: Some(id),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Serialize to wire JSON.
    pub fn encode(&self) -> Result<String, ScoutError> {
        let mut value =
            serde_json::to_value(&self.message).map_err(|e| ScoutError::MalformedEnvelope {
                message: e.to_string(),
            })?;
        if let (Some(id), Some(obj)) = (&self.correlation_id, value.as_object_mut()) {
            obj.insert("correlationId".into(), Value::String(id.0.clone()));
        }
        Ok(value.to_string())
    }

    /// Decode wire JSON.
    ///
    /// A JSON object with a string `type` outside the closed set yields
    /// [`ScoutError::UnknownMessageType`]; anything else that fails to
    /// decode yields [`ScoutError::MalformedEnvelope`].
    pub fn decode(text: &str) -> Result<Self, ScoutError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ScoutError::MalformedEnvelope {
            message: e.to_string(),
        })?;
        let Value::Object(mut obj) = value else {
            return Err(ScoutError::MalformedEnvelope {
                message: "envelope is not a JSON object".into(),
            });
        };

        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ScoutError::MalformedEnvelope {
                message: "missing string field `type`".into(),
            })?
            .to_string();
        if MessageType::parse(&type_name).is_none() {
            return Err(ScoutError::UnknownMessageType { type_name });
        }

        let correlation_id = match obj.remove("correlationId") {
            Some(Value::String(s)) => Some(CorrelationId(s)),
            _ => None,
        };
        // Payload-less types may arrive with an explicit `"payload": null`.
        if obj.get("payload").is_some_and(Value::is_null) {
            obj.remove("payload");
        }

        let message: Message =
            serde_json::from_value(Value::Object(obj)).map_err(|e| ScoutError::MalformedEnvelope {
                message: format!("bad {type_name} payload: {e}"),
            })?;

        Ok(Envelope {
            message,
            correlation_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Reply helpers
// ---------------------------------------------------------------------------

/// The reply shape for any failure: `{"error": "<message>"}`.
pub fn error_reply(message: impl fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Acknowledgement for commands, optionally carrying extra fields.
pub fn ack_reply(extra: Map<String, Value>) -> Value {
    let mut obj = Map::new();
    obj.insert("ok".into(), Value::Bool(true));
    obj.extend(extra);
    Value::Object(obj)
}

/// The error message of an `{"error": ...}` reply, if it is one.
pub fn reply_error(reply: &Value) -> Option<&str> {
    reply.get("error").and_then(Value::as_str)
}

/// Convert an `{"error": ...}` reply into [`ScoutError::Remote`].
pub fn into_result(reply: Value) -> Result<Value, ScoutError> {
    match reply_error(&reply) {
        Some(message) => Err(ScoutError::Remote {
            message: message.to_string(),
        }),
        None => Ok(reply),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
