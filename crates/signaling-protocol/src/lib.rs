//! Signaling protocol for the SFU coordinator.
//!
//! Every message on the signaling channel is one JSON text frame shaped as
//! an envelope of a type tag plus a payload:
//!
//! ```json
//! {"type": "produce", "payload": {"transportId": "...", "kind": "video", "rtpParameters": {}}}
//! ```
//!
//! - [`message`] - client-to-coordinator and coordinator-to-client message enums
//! - [`rtp`] - media descriptors exchanged during negotiation
//! - [`codec`] - envelope decoding/encoding

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;
pub mod rtp;

pub use codec::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    ProtocolError,
};
pub use message::{ClientMessage, ProducerSummary, ServerMessage};
pub use rtp::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, SctpParameters, TransportDirection,
};
