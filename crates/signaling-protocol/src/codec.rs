//! Encoding and decoding of signaling envelopes.
//!
//! Decoding happens in two steps: the raw envelope is parsed first so that an
//! unrecognized `type` can be told apart from a recognized one whose payload
//! is malformed.

use crate::message::{ClientMessage, ServerMessage};
use serde::Deserialize;
use serde_json::{json, Value};

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope, or the payload does not fit the type
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Envelope carries a type tag this side does not understand
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Outbound message could not be serialized
    #[error("Encoding failed: {0}")]
    Encode(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    message_type: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

fn split_envelope(text: &str) -> Result<(String, Value), ProtocolError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let message_type = raw
        .message_type
        .ok_or_else(|| ProtocolError::Malformed("missing type".to_string()))?;

    // Messages whose fields are all optional may omit the payload entirely.
    let payload = match raw.payload {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(payload) => payload,
    };

    Ok((message_type, payload))
}

/// Decode a text frame received from a client
///
/// # Errors
///
/// Returns `UnknownMessageType` for an unrecognized tag and `Malformed` for
/// anything else that does not decode.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let (message_type, payload) = split_envelope(text)?;

    if !ClientMessage::TYPES.contains(&message_type.as_str()) {
        return Err(ProtocolError::UnknownMessageType(message_type));
    }

    serde_json::from_value(json!({ "type": message_type, "payload": payload }))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a message for a client
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_server_message(message: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a text frame sent by the coordinator
///
/// # Errors
///
/// Returns `Malformed` if the frame is not a valid server message
pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a message as a client would send it
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rtp::{MediaKind, TransportDirection};
    use common::types::{ConsumerId, TransportId};

    #[test]
    fn test_decode_create_transport() {
        let msg = decode_client_message(
            r#"{"type":"createTransport","payload":{"direction":"receive"}}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::CreateTransport {
                direction: TransportDirection::Recv
            }
        );
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let err = decode_client_message(r#"{"type":"restartIce","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(t) if t == "restartIce"));
    }

    #[test]
    fn test_not_json_is_malformed() {
        let err = decode_client_message("hello").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = decode_client_message(r#"{"payload":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_bad_payload_for_known_type_is_malformed() {
        let err = decode_client_message(
            r#"{"type":"produce","payload":{"transportId":"nope","kind":"video"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = decode_client_message(
            r#"{"type":"createTransport","payload":{"direction":"sideways"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_payload_may_be_omitted_for_optional_fields() {
        let msg = decode_client_message(r#"{"type":"close"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Close {
                consumer_id: None,
                producer_id: None,
                transport_id: None,
            }
        );
    }

    #[test]
    fn test_client_message_survives_the_wire() {
        let transport_id = TransportId::new();
        let msg = ClientMessage::Produce {
            transport_id,
            kind: MediaKind::Audio,
            rtp_parameters: crate::rtp::RtpParameters::default(),
        };

        let text = encode_client_message(&msg).unwrap();
        assert_eq!(decode_client_message(&text).unwrap(), msg);
    }

    #[test]
    fn test_server_message_survives_the_wire() {
        let msg = ServerMessage::Resumed {
            consumer_id: Some(ConsumerId::new()),
            producer_id: None,
        };

        let text = encode_server_message(&msg).unwrap();
        assert_eq!(decode_server_message(&text).unwrap(), msg);
    }
}
