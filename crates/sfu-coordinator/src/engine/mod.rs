//! Media engine adapter.
//!
//! The coordinator never touches RTP itself. It drives an external media
//! engine through the narrow [`MediaEngine`] capability set and reacts to
//! the engine's lifecycle events, which arrive on a channel handed out once
//! by [`MediaEngine::take_events`].
//!
//! - [`local`] - in-process engine used by the binary

pub mod local;

pub use local::{LocalEngine, LocalEngineConfig};

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
    SctpParameters, TransportDirection,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the media engine for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine refused the operation.
    #[error("engine rejected operation: {0}")]
    Rejected(String),

    /// The handle does not exist in the engine (already closed).
    #[error("unknown engine handle: {0}")]
    UnknownHandle(EngineHandle),

    /// The configured RTC port range has no free port left.
    #[error("no free RTC port in range")]
    PortsExhausted,

    /// The engine worker is gone.
    #[error("engine worker unavailable")]
    WorkerUnavailable,
}

/// Typed reference to an engine-side object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineHandle {
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineHandle::Transport(id) => write!(f, "transport:{id}"),
            EngineHandle::Producer(id) => write!(f, "producer:{id}"),
            EngineHandle::Consumer(id) => write!(f, "consumer:{id}"),
        }
    }
}

/// Lifecycle events raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transport was closed by the engine.
    TransportClosed { transport_id: TransportId },
    /// A producer went away because its transport closed.
    ProducerClosed { producer_id: ProducerId },
    /// A consumer went away because the producer it reads from closed.
    ConsumerProducerClosed { consumer_id: ConsumerId },
    /// The engine worker died; no further media operation can succeed.
    WorkerDied { reason: String },
}

impl EngineEvent {
    /// Bounded label for the `sfu_engine_events_total` metric.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            EngineEvent::TransportClosed { .. } => "transport_closed",
            EngineEvent::ProducerClosed { .. } => "producer_closed",
            EngineEvent::ConsumerProducerClosed { .. } => "consumer_producer_closed",
            EngineEvent::WorkerDied { .. } => "worker_died",
        }
    }
}

/// Connection parameters of a newly created server-side transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    /// Present for send transports only.
    pub sctp_parameters: Option<SctpParameters>,
}

/// Parameters of a newly created consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// Engine contract: always `true` on creation.
    pub paused: bool,
}

/// Capability set of the external media engine.
///
/// All calls may suspend; none are made while the registry lock is held.
/// `pause`, `resume` and `close` are idempotent.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and header extensions the router can forward.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Create a transport for the given direction.
    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError>;

    /// Apply the client's DTLS parameters to a transport.
    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Start receiving a stream on a send transport.
    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a client with `rtp_capabilities` can receive the producer.
    async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities)
        -> bool;

    /// Start forwarding a producer over a receive transport. The consumer
    /// starts paused.
    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError>;

    /// Pause a producer or consumer.
    async fn pause(&self, handle: EngineHandle) -> Result<(), EngineError>;

    /// Resume a producer or consumer.
    async fn resume(&self, handle: EngineHandle) -> Result<(), EngineError>;

    /// Close any handle. Unknown handles are ignored.
    async fn close(&self, handle: EngineHandle);

    /// Hand out the lifecycle event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;
}
