//! Signaling messages exchanged between clients and the coordinator.
//!
//! Every message travels in an envelope `{"type": <tag>, "payload": {...}}`.
//! Both directions are modelled as adjacently tagged enums so the tag and
//! payload map one-to-one onto a variant.

use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    SctpParameters, TransportDirection,
};
use common::types::{ClientId, ConsumerId, ProducerId, SessionId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent by a client to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join (and lazily create) a session.
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: SessionId,
        user_id: String,
        #[serde(default)]
        user_info: Value,
    },

    /// Create a server-side transport.
    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },

    /// Complete DTLS negotiation for a transport.
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Publish a media stream over a send transport.
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Subscribe to a producer over a receive transport.
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Resume a consumer and/or producer.
    #[serde(rename_all = "camelCase")]
    Resume {
        #[serde(default)]
        consumer_id: Option<ConsumerId>,
        #[serde(default)]
        producer_id: Option<ProducerId>,
    },

    /// Pause a consumer and/or producer.
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        consumer_id: Option<ConsumerId>,
        #[serde(default)]
        producer_id: Option<ProducerId>,
    },

    /// Close any combination of consumer, producer and transport.
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        consumer_id: Option<ConsumerId>,
        #[serde(default)]
        producer_id: Option<ProducerId>,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },
}

impl ClientMessage {
    /// Every tag a client may send.
    pub const TYPES: &'static [&'static str] = &[
        "join",
        "createTransport",
        "connectTransport",
        "produce",
        "consume",
        "resume",
        "pause",
        "close",
    ];

    /// Wire tag of this message, used for logging and metric labels.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::CreateTransport { .. } => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::Resume { .. } => "resume",
            ClientMessage::Pause { .. } => "pause",
            ClientMessage::Close { .. } => "close",
        }
    }
}

/// A producer already published in a session, listed in the join reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub client_id: ClientId,
    pub user_id: String,
    pub kind: MediaKind,
}

/// Messages sent by the coordinator to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Reply to `join`.
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities {
        client_id: ClientId,
        rtp_capabilities: RtpCapabilities,
        producers: Vec<ProducerSummary>,
    },

    /// Reply to `createTransport`.
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: TransportId,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sctp_parameters: Option<SctpParameters>,
    },

    /// Reply to `connectTransport`.
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },

    /// Reply to `produce`.
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// Reply to `consume`. Consumers always start paused.
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },

    /// Reply to `resume`, one per entity resumed.
    #[serde(rename_all = "camelCase")]
    Resumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<ProducerId>,
    },

    /// Reply to `pause`, one per entity paused.
    #[serde(rename_all = "camelCase")]
    Paused {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<ProducerId>,
    },

    /// A peer published a stream.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        client_id: ClientId,
        user_id: String,
        kind: MediaKind,
    },

    /// A peer paused its stream.
    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        producer_id: ProducerId,
        client_id: ClientId,
    },

    /// A peer resumed its stream.
    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        producer_id: ProducerId,
        client_id: ClientId,
    },

    /// A peer's stream went away.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        client_id: ClientId,
    },

    /// One of the recipient's consumers was removed because its source went away.
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    /// A request failed.
    Error { error: String, code: i32 },
}

impl ServerMessage {
    /// Wire tag of this message, used for logging.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::RouterRtpCapabilities { .. } => "routerRtpCapabilities",
            ServerMessage::TransportCreated { .. } => "transportCreated",
            ServerMessage::TransportConnected { .. } => "transportConnected",
            ServerMessage::Produced { .. } => "produced",
            ServerMessage::Consumed { .. } => "consumed",
            ServerMessage::Resumed { .. } => "resumed",
            ServerMessage::Paused { .. } => "paused",
            ServerMessage::NewProducer { .. } => "newProducer",
            ServerMessage::ProducerPaused { .. } => "producerPaused",
            ServerMessage::ProducerResumed { .. } => "producerResumed",
            ServerMessage::ProducerClosed { .. } => "producerClosed",
            ServerMessage::ConsumerClosed { .. } => "consumerClosed",
            ServerMessage::Error { .. } => "error",
        }
    }
}
