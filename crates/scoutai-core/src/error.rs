// Error taxonomy shared by every context.
//
// Errors never cross a context boundary as Rust values: anything a receiver
// fails with is converted to the `{"error": "..."}` reply shape before it is
// handed back to the sender (see `protocol::error_reply`).

use thiserror::Error;

use crate::protocol::{ContextAddr, MessageType};

/// Failures observable by a sender or a user-facing surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoutError {
    /// The addressed context does not exist or rejected the channel (tab
    /// closed, content script never injected, popup already closed).
    #[error("could not reach {target}")]
    UnreachableTarget { target: ContextAddr },

    /// No reply arrived within the configured bound.
    #[error("{message_type} to {target} timed out after {after_ms}ms")]
    Timeout {
        target: ContextAddr,
        message_type: MessageType,
        after_ms: u64,
    },

    /// The draft-state extractor found no draft table on the page.
    #[error("No draft detected on this page")]
    NoDraftDetected,

    /// The scoring service (or the network in front of it) failed.
    /// `status` is `None` when no HTTP response was received at all.
    #[error("{message}")]
    Http { status: Option<u16>, message: String },

    /// A well-formed envelope whose `type` is outside the closed set.
    #[error("Unknown message type: {type_name}")]
    UnknownMessageType { type_name: String },

    /// The envelope could not be decoded at all.
    #[error("malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    /// A handler claimed a request and released it without replying.
    #[error("{message_type} was claimed but never answered")]
    ReplyDropped { message_type: MessageType },

    /// The receiver answered with an `{"error": ...}` reply.
    #[error("{message}")]
    Remote { message: String },
}

impl ScoutError {
    /// Whether this error is an expected transient race that should be
    /// logged rather than shown to the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScoutError::UnreachableTarget { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_displays_message_only() {
        let err = ScoutError::Http {
            status: Some(503),
            message: "API request failed: 503 Service Unavailable".into(),
        };
        assert_eq!(err.to_string(), "API request failed: 503 Service Unavailable");
    }

    #[test]
    fn unknown_type_names_the_type() {
        let err = ScoutError::UnknownMessageType {
            type_name: "OPEN_PANEL".into(),
        };
        assert_eq!(err.to_string(), "Unknown message type: OPEN_PANEL");
    }

    #[test]
    fn timeout_names_target_and_type() {
        let err = ScoutError::Timeout {
            target: ContextAddr::Tab(7),
            message_type: MessageType::ExtractDraftState,
            after_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "EXTRACT_DRAFT_STATE to tab 7 timed out after 5000ms"
        );
    }

    #[test]
    fn only_unreachable_is_transient() {
        assert!(ScoutError::UnreachableTarget {
            target: ContextAddr::Popup
        }
        .is_transient());
        assert!(!ScoutError::NoDraftDetected.is_transient());
    }
}
