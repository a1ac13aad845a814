//! SFU coordinator error types.
//!
//! Every request-level failure is recovered at the handler boundary and
//! turned into an `error` reply for the originating connection. Internal
//! details are logged server-side but never sent to clients.

use crate::engine::EngineError;
use signaling_protocol::{ProtocolError, ServerMessage};
use std::fmt;
use thiserror::Error;

/// Kind of registry entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Client,
    Transport,
    Producer,
    Consumer,
}

impl EntityKind {
    /// Returns the kind as a lowercase string for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Transport => "transport",
            EntityKind::Producer => "producer",
            EntityKind::Consumer => "consumer",
        }
    }

    const fn title(self) -> &'static str {
        match self {
            EntityKind::Client => "Client",
            EntityKind::Transport => "Transport",
            EntityKind::Producer => "Producer",
            EntityKind::Consumer => "Consumer",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SFU coordinator error type.
///
/// Maps to signaling error codes:
/// - Malformed/unknown messages, protocol misuse: `BAD_REQUEST` (1)
/// - `NotOwner`: `FORBIDDEN` (3)
/// - `EntityNotFound`: `NOT_FOUND` (4)
/// - `AlreadyJoined`: `CONFLICT` (5)
/// - Engine and internal failures: `INTERNAL_ERROR` (6)
/// - `SessionFull`, `CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Frame could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Frame carried an unrecognized type tag.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Request requires a joined client.
    #[error("Connection has not joined a session")]
    NotJoined,

    /// Connection already joined a session.
    #[error("Connection already joined a session")]
    AlreadyJoined,

    /// Referenced entity is not registered.
    #[error("{0} not found")]
    EntityNotFound(EntityKind),

    /// Referenced entity belongs to another client.
    #[error("{0} is owned by another client")]
    NotOwner(EntityKind),

    /// Produce on a receive transport or consume on a send transport.
    #[error("Transport direction does not allow this operation")]
    WrongDirection,

    /// Remote capabilities cannot receive the producer's codecs.
    #[error("Capabilities cannot consume producer")]
    CapabilityMismatch,

    /// The media engine rejected the call.
    #[error("Engine operation failed: {0}")]
    EngineOperationFailed(#[from] EngineError),

    /// Session reached its participant limit.
    #[error("Session is full")]
    SessionFull,

    /// Coordinator reached its session limit.
    #[error("Session capacity exceeded")]
    CapacityExceeded,

    /// Coordinator is shutting down.
    #[error("Coordinator is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::MalformedMessage(_)
            | SfuError::UnknownMessageType(_)
            | SfuError::NotJoined
            | SfuError::WrongDirection
            | SfuError::CapabilityMismatch => 1, // BAD_REQUEST
            SfuError::NotOwner(_) => 3,          // FORBIDDEN
            SfuError::EntityNotFound(_) => 4,    // NOT_FOUND
            SfuError::AlreadyJoined => 5,        // CONFLICT
            SfuError::EngineOperationFailed(_) | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::SessionFull | SfuError::CapacityExceeded | SfuError::Draining => 7, // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::MalformedMessage(_) => "Invalid message format".to_string(),
            SfuError::UnknownMessageType(message_type) => {
                format!("Unknown message type: {message_type}")
            }
            SfuError::NotJoined => "Not joined to a session".to_string(),
            SfuError::AlreadyJoined => "Already joined to a session".to_string(),
            SfuError::EntityNotFound(kind) => format!("{} not found", kind.title()),
            SfuError::NotOwner(kind) => format!("{} belongs to another client", kind.title()),
            SfuError::WrongDirection => {
                "Transport direction does not allow this operation".to_string()
            }
            SfuError::CapabilityMismatch => "Cannot consume".to_string(),
            SfuError::EngineOperationFailed(_) => "Media operation failed".to_string(),
            SfuError::SessionFull => "Session is full".to_string(),
            SfuError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Bounded label for the `sfu_errors_total` metric.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            SfuError::MalformedMessage(_) => "malformed_message",
            SfuError::UnknownMessageType(_) => "unknown_message_type",
            SfuError::NotJoined => "not_joined",
            SfuError::AlreadyJoined => "already_joined",
            SfuError::EntityNotFound(_) => "entity_not_found",
            SfuError::NotOwner(_) => "not_owner",
            SfuError::WrongDirection => "wrong_direction",
            SfuError::CapabilityMismatch => "capability_mismatch",
            SfuError::EngineOperationFailed(_) => "engine_operation_failed",
            SfuError::SessionFull => "session_full",
            SfuError::CapacityExceeded => "capacity_exceeded",
            SfuError::Draining => "draining",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Build the `error` reply sent to the requester.
    #[must_use]
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            error: self.client_message(),
            code: self.error_code(),
        }
    }
}

impl From<ProtocolError> for SfuError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Malformed(detail) => SfuError::MalformedMessage(detail),
            ProtocolError::UnknownMessageType(message_type) => {
                SfuError::UnknownMessageType(message_type)
            }
            ProtocolError::Encode(detail) => SfuError::Internal(detail),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Bad request -> 1
        assert_eq!(SfuError::MalformedMessage("eof".to_string()).error_code(), 1);
        assert_eq!(
            SfuError::UnknownMessageType("restartIce".to_string()).error_code(),
            1
        );
        assert_eq!(SfuError::NotJoined.error_code(), 1);
        assert_eq!(SfuError::WrongDirection.error_code(), 1);
        assert_eq!(SfuError::CapabilityMismatch.error_code(), 1);

        // Forbidden -> 3
        assert_eq!(SfuError::NotOwner(EntityKind::Producer).error_code(), 3);

        // Not found -> 4
        assert_eq!(
            SfuError::EntityNotFound(EntityKind::Transport).error_code(),
            4
        );

        // Conflict -> 5
        assert_eq!(SfuError::AlreadyJoined.error_code(), 5);

        // Internal -> 6
        assert_eq!(
            SfuError::EngineOperationFailed(EngineError::Rejected("dtls".to_string()))
                .error_code(),
            6
        );
        assert_eq!(SfuError::Internal("lock".to_string()).error_code(), 6);

        // Capacity -> 7
        assert_eq!(SfuError::SessionFull.error_code(), 7);
        assert_eq!(SfuError::CapacityExceeded.error_code(), 7);
        assert_eq!(SfuError::Draining.error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let engine_err =
            SfuError::EngineOperationFailed(EngineError::Rejected("worker 10.0.0.7".to_string()));
        assert!(!engine_err.client_message().contains("10.0.0.7"));

        let internal = SfuError::Internal("registry invariant broken".to_string());
        assert_eq!(internal.client_message(), "An internal error occurred");

        let malformed = SfuError::MalformedMessage("expected value at line 1".to_string());
        assert_eq!(malformed.client_message(), "Invalid message format");
    }

    #[test]
    fn test_entity_messages() {
        assert_eq!(
            SfuError::EntityNotFound(EntityKind::Consumer).client_message(),
            "Consumer not found"
        );
        assert_eq!(
            SfuError::NotOwner(EntityKind::Transport).to_string(),
            "transport is owned by another client"
        );
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: SfuError = ProtocolError::UnknownMessageType("foo".to_string()).into();
        assert!(matches!(err, SfuError::UnknownMessageType(t) if t == "foo"));

        let err: SfuError = ProtocolError::Malformed("bad".to_string()).into();
        assert!(matches!(err, SfuError::MalformedMessage(_)));
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = SfuError::NotJoined.to_server_message();
        assert_eq!(
            reply,
            ServerMessage::Error {
                error: "Not joined to a session".to_string(),
                code: 1,
            }
        );
    }
}
