//! Media negotiation descriptors.
//!
//! These mirror the shapes a WebRTC media engine exchanges with browsers.
//! The coordinator only inspects a few fields (codec mime types for
//! compatibility checks); everything else is carried through opaquely.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of media carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl MediaKind {
    /// Returns the kind as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportDirection {
    /// Client sends media (produce)
    #[serde(rename = "send")]
    Send,
    /// Client receives media (consume)
    #[serde(rename = "recv", alias = "receive", alias = "rcv")]
    Recv,
}

impl TransportDirection {
    /// Returns the direction as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A codec the router (or a remote endpoint) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    /// Media kind of the codec
    pub kind: MediaKind,
    /// Codec mime type, e.g. `audio/opus`
    pub mime_type: String,
    /// Payload type preferred by the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec specific parameters (fmtp)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// Capability descriptor exchanged during join and consume negotiation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    /// Supported codecs
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    /// Supported RTP header extensions (opaque)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Whether a codec with the given mime type (case-insensitive) is supported
    #[must_use]
    pub fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// One codec entry of a concrete RTP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    /// Codec mime type
    pub mime_type: String,
    /// Negotiated payload type
    pub payload_type: u8,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Audio channel count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec specific parameters (fmtp)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// RTP parameters of a produced or consumed stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    /// Media section identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    /// Codecs in preference order
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    /// Everything else (encodings, header extensions, rtcp) carried opaquely
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// ICE credentials of a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    /// ICE username fragment
    pub username_fragment: String,
    /// ICE password
    pub password: String,
    /// Whether the server is an ICE-lite endpoint
    pub ice_lite: bool,
}

/// A host candidate advertised for a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate foundation
    pub foundation: String,
    /// Candidate priority
    pub priority: u32,
    /// Announced IP address
    pub ip: String,
    /// `udp` or `tcp`
    pub protocol: String,
    /// Port number
    pub port: u16,
    /// Candidate type (always `host` for a server)
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    /// Hash algorithm, e.g. `sha-256`
    pub algorithm: String,
    /// Colon separated hex digest
    pub value: String,
}

/// DTLS parameters of either side of a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    /// `auto`, `client` or `server`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Certificate fingerprints
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// SCTP parameters for data channels on send transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    /// SCTP port
    pub port: u16,
    /// Outgoing streams
    #[serde(rename = "OS")]
    pub os: u16,
    /// Maximum incoming streams
    #[serde(rename = "MIS")]
    pub mis: u16,
    /// Maximum message size in bytes
    pub max_message_size: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_aliases() {
        let recv: TransportDirection = serde_json::from_value(json!("recv")).unwrap();
        let receive: TransportDirection = serde_json::from_value(json!("receive")).unwrap();
        let rcv: TransportDirection = serde_json::from_value(json!("rcv")).unwrap();
        assert_eq!(recv, TransportDirection::Recv);
        assert_eq!(receive, TransportDirection::Recv);
        assert_eq!(rcv, TransportDirection::Recv);

        assert_eq!(
            serde_json::to_value(TransportDirection::Recv).unwrap(),
            json!("recv")
        );
        assert!(serde_json::from_value::<TransportDirection>(json!("sideways")).is_err());
    }

    #[test]
    fn test_capabilities_mime_type_lookup_ignores_case() {
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
            ]
        }))
        .unwrap();

        assert!(caps.supports_mime_type("video/vp8"));
        assert!(!caps.supports_mime_type("video/H264"));
    }

    #[test]
    fn test_rtp_parameters_keep_unknown_fields() {
        let value = json!({
            "mid": "0",
            "codecs": [
                {"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}
            ],
            "encodings": [{"ssrc": 1234}],
            "rtcp": {"cname": "abc"}
        });

        let params: RtpParameters = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert!(params.extra.contains_key("encodings"));
        assert_eq!(serde_json::to_value(&params).unwrap(), value);
    }
}
