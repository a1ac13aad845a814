//! In-process media engine.
//!
//! `LocalEngine` keeps the engine-side object graph (transports, producers,
//! consumers), allocates ICE ports from the configured range, and raises the
//! same lifecycle events a real worker would when closes cascade.

use super::{ConsumerInfo, EngineError, EngineEvent, EngineHandle, MediaEngine, TransportInfo};
use crate::config::Config;

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use serde_json::{json, Map};
use signaling_protocol::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, SctpParameters, TransportDirection,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// First dynamic payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// SCTP stream counts offered on send transports.
const SCTP_STREAMS: u16 = 1024;

/// Largest SCTP message accepted on send transports.
const SCTP_MAX_MESSAGE_SIZE: u32 = 262_144;

/// Settings for [`LocalEngine`].
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    pub listen_ip: String,
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_outgoing_bitrate: u32,
    /// Codecs the router forwards. Payload types are assigned on startup.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl LocalEngineConfig {
    /// Build engine settings from the service configuration with the default codec set.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
            media_codecs: default_media_codecs(),
        }
    }
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        use crate::config::{
            DEFAULT_ANNOUNCED_IP, DEFAULT_INITIAL_OUTGOING_BITRATE, DEFAULT_LISTEN_IP,
            DEFAULT_RTC_MAX_PORT, DEFAULT_RTC_MIN_PORT,
        };

        Self {
            listen_ip: DEFAULT_LISTEN_IP.to_string(),
            announced_ip: DEFAULT_ANNOUNCED_IP.to_string(),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            initial_outgoing_bitrate: DEFAULT_INITIAL_OUTGOING_BITRATE,
            media_codecs: default_media_codecs(),
        }
    }
}

/// Opus, VP8 and baseline H264.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_parameters = Map::new();
    h264_parameters.insert("packetization-mode".to_string(), json!(1));
    h264_parameters.insert("profile-level-id".to_string(), json!("42e01f"));
    h264_parameters.insert("level-asymmetry-allowed".to_string(), json!(1));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: h264_parameters,
        },
    ]
}

#[derive(Debug)]
struct LocalTransport {
    direction: TransportDirection,
    port: u16,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
    /// Next media section id; never reused while the transport lives.
    next_mid: u32,
}

#[derive(Debug)]
struct LocalProducer {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
    consumers: HashSet<ConsumerId>,
}

#[derive(Debug)]
struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
    ports_in_use: HashSet<u16>,
    next_port: u16,
}

/// In-process [`MediaEngine`] implementation.
pub struct LocalEngine {
    config: LocalEngineConfig,
    capabilities: RtpCapabilities,
    fingerprint: DtlsFingerprint,
    state: Mutex<EngineState>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl LocalEngine {
    /// Create the engine and its router.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Rejected` if the codec list or the port range is
    /// empty, or there are more codecs than dynamic payload types.
    pub fn new(config: LocalEngineConfig) -> Result<Self, EngineError> {
        if config.media_codecs.is_empty() {
            return Err(EngineError::Rejected("no media codecs configured".to_string()));
        }
        if config.rtc_min_port > config.rtc_max_port {
            return Err(EngineError::Rejected("empty RTC port range".to_string()));
        }

        let mut codecs = Vec::with_capacity(config.media_codecs.len());
        for (offset, codec) in config.media_codecs.iter().enumerate() {
            let payload_type = u8::try_from(offset)
                .ok()
                .and_then(|offset| FIRST_DYNAMIC_PAYLOAD_TYPE.checked_add(offset))
                .filter(|pt| *pt <= 127)
                .ok_or_else(|| EngineError::Rejected("too many media codecs".to_string()))?;
            codecs.push(RtpCodecCapability {
                preferred_payload_type: Some(payload_type),
                ..codec.clone()
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = EngineState {
            next_port: config.rtc_min_port,
            ..EngineState::default()
        };

        debug!(
            target: "sfu.engine",
            listen_ip = %config.listen_ip,
            announced_ip = %config.announced_ip,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            codecs = codecs.len(),
            "Local media engine created"
        );

        Ok(Self {
            config,
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            fingerprint: generate_fingerprint(),
            state: Mutex::new(state),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// Number of live engine objects (transports, producers, consumers).
    pub async fn object_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (
            state.transports.len(),
            state.producers.len(),
            state.consumers.len(),
        )
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(target: "sfu.engine", "Engine event dropped, no subscriber");
        }
    }

    fn allocate_port(&self, state: &mut EngineState) -> Result<u16, EngineError> {
        let min = self.config.rtc_min_port;
        let max = self.config.rtc_max_port;
        let range = usize::from(max - min) + 1;

        let mut candidate = state.next_port.clamp(min, max);
        for _ in 0..range {
            let next = if candidate == max { min } else { candidate + 1 };
            if state.ports_in_use.insert(candidate) {
                state.next_port = next;
                return Ok(candidate);
            }
            candidate = next;
        }

        Err(EngineError::PortsExhausted)
    }

    fn router_supports(&self, mime_type: &str) -> bool {
        self.capabilities.supports_mime_type(mime_type)
    }

    /// Mime types a consumer of this producer could receive.
    fn producer_mime_types(&self, producer: &LocalProducer) -> Vec<String> {
        if producer.rtp_parameters.codecs.is_empty() {
            self.capabilities
                .codecs
                .iter()
                .filter(|codec| codec.kind == producer.kind)
                .map(|codec| codec.mime_type.clone())
                .collect()
        } else {
            producer
                .rtp_parameters
                .codecs
                .iter()
                .map(|codec| codec.mime_type.clone())
                .collect()
        }
    }

    fn remove_consumer(state: &mut EngineState, consumer_id: ConsumerId) -> bool {
        let Some(consumer) = state.consumers.remove(&consumer_id) else {
            return false;
        };
        if let Some(transport) = state.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(producer) = state.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        true
    }

    /// Remove a producer and every consumer reading from it. Returns the
    /// consumers that lost their producer.
    fn remove_producer(state: &mut EngineState, producer_id: ProducerId) -> Vec<ConsumerId> {
        let Some(producer) = state.producers.remove(&producer_id) else {
            return Vec::new();
        };
        if let Some(transport) = state.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }

        let orphaned: Vec<ConsumerId> = producer.consumers.into_iter().collect();
        for consumer_id in &orphaned {
            Self::remove_consumer(state, *consumer_id);
        }
        orphaned
    }
}

fn generate_fingerprint() -> DtlsFingerprint {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

fn random_token(len: usize) -> String {
    let mut token = String::with_capacity(len);
    while token.len() < len {
        token.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        let mut state = self.state.lock().await;
        let port = self.allocate_port(&mut state)?;
        let id = TransportId::new();

        state.transports.insert(
            id,
            LocalTransport {
                direction,
                port,
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
                next_mid: 0,
            },
        );
        drop(state);

        debug!(
            target: "sfu.engine",
            transport_id = %id,
            direction = %direction,
            port = port,
            initial_outgoing_bitrate = self.config.initial_outgoing_bitrate,
            "Transport created"
        );

        let ice_candidates = vec![
            IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.config.announced_ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            },
            IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: 1_076_276_479,
                ip: self.config.announced_ip.clone(),
                protocol: "tcp".to_string(),
                port,
                candidate_type: "host".to_string(),
            },
        ];

        let sctp_parameters = match direction {
            TransportDirection::Send => Some(SctpParameters {
                port: 5000,
                os: SCTP_STREAMS,
                mis: SCTP_STREAMS,
                max_message_size: SCTP_MAX_MESSAGE_SIZE,
            }),
            TransportDirection::Recv => None,
        };

        Ok(TransportInfo {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![self.fingerprint.clone()],
            },
            sctp_parameters,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected(
                "dtls parameters carry no fingerprint".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownHandle(EngineHandle::Transport(
                transport_id,
            )))?;

        if transport.connected {
            return Err(EngineError::Rejected(
                "transport already connected".to_string(),
            ));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        if let Some(codec) = rtp_parameters
            .codecs
            .iter()
            .find(|codec| !self.router_supports(&codec.mime_type))
        {
            return Err(EngineError::Rejected(format!(
                "unsupported codec {}",
                codec.mime_type
            )));
        }

        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownHandle(EngineHandle::Transport(
                transport_id,
            )))?;

        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Rejected(
                "cannot produce on a receive transport".to_string(),
            ));
        }

        let id = ProducerId::new();
        transport.producers.insert(id);
        state.producers.insert(
            id,
            LocalProducer {
                transport_id,
                kind,
                rtp_parameters,
                paused: false,
                consumers: HashSet::new(),
            },
        );

        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock().await;
        let Some(producer) = state.producers.get(&producer_id) else {
            return false;
        };

        self.producer_mime_types(producer)
            .iter()
            .any(|mime| self.router_supports(mime) && rtp_capabilities.supports_mime_type(mime))
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        let mut state = self.state.lock().await;

        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownHandle(EngineHandle::Producer(
                producer_id,
            )))?;
        let kind = producer.kind;

        let mime_types: Vec<String> = self
            .producer_mime_types(producer)
            .into_iter()
            .filter(|mime| rtp_capabilities.supports_mime_type(mime))
            .collect();
        if mime_types.is_empty() {
            return Err(EngineError::Rejected(
                "no common codec with producer".to_string(),
            ));
        }

        let codecs: Vec<RtpCodecParameters> = self
            .capabilities
            .codecs
            .iter()
            .filter(|codec| mime_types.iter().any(|m| m.eq_ignore_ascii_case(&codec.mime_type)))
            .map(|codec| RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(FIRST_DYNAMIC_PAYLOAD_TYPE),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
            })
            .collect();

        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownHandle(EngineHandle::Transport(
                transport_id,
            )))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::Rejected(
                "cannot consume on a send transport".to_string(),
            ));
        }

        let id = ConsumerId::new();
        let mid = transport.next_mid.to_string();
        transport.next_mid = transport.next_mid.wrapping_add(1);
        transport.consumers.insert(id);

        if let Some(producer) = state.producers.get_mut(&producer_id) {
            producer.consumers.insert(id);
        }
        state.consumers.insert(
            id,
            LocalConsumer {
                transport_id,
                producer_id,
                paused: true,
            },
        );

        let ssrc = uuid::Uuid::new_v4().as_fields().0;
        let mut extra = Map::new();
        extra.insert("encodings".to_string(), json!([{ "ssrc": ssrc }]));
        extra.insert(
            "rtcp".to_string(),
            json!({ "cname": random_token(8), "reducedSize": true }),
        );

        Ok(ConsumerInfo {
            id,
            producer_id,
            kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid),
                codecs,
                extra,
            },
            paused: true,
        })
    }

    async fn pause(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match handle {
            EngineHandle::Producer(id) => {
                let producer = state
                    .producers
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle(handle))?;
                producer.paused = true;
            }
            EngineHandle::Consumer(id) => {
                let consumer = state
                    .consumers
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle(handle))?;
                consumer.paused = true;
            }
            EngineHandle::Transport(_) => {
                return Err(EngineError::Rejected(
                    "transports cannot be paused".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn resume(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match handle {
            EngineHandle::Producer(id) => {
                let producer = state
                    .producers
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle(handle))?;
                producer.paused = false;
            }
            EngineHandle::Consumer(id) => {
                let consumer = state
                    .consumers
                    .get_mut(&id)
                    .ok_or(EngineError::UnknownHandle(handle))?;
                consumer.paused = false;
            }
            EngineHandle::Transport(_) => {
                return Err(EngineError::Rejected(
                    "transports cannot be resumed".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn close(&self, handle: EngineHandle) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            match handle {
                EngineHandle::Consumer(id) => {
                    Self::remove_consumer(&mut state, id);
                }
                EngineHandle::Producer(id) => {
                    for consumer_id in Self::remove_producer(&mut state, id) {
                        events.push(EngineEvent::ConsumerProducerClosed { consumer_id });
                    }
                }
                EngineHandle::Transport(id) => {
                    let Some(transport) = state.transports.remove(&id) else {
                        return;
                    };
                    state.ports_in_use.remove(&transport.port);

                    for consumer_id in transport.consumers {
                        Self::remove_consumer(&mut state, consumer_id);
                    }
                    for producer_id in transport.producers {
                        for consumer_id in Self::remove_producer(&mut state, producer_id) {
                            events.push(EngineEvent::ConsumerProducerClosed { consumer_id });
                        }
                        events.push(EngineEvent::ProducerClosed { producer_id });
                    }
                }
            }
        }

        debug!(
            target: "sfu.engine",
            handle = %handle,
            cascaded_events = events.len(),
            "Engine handle closed"
        );

        for event in events {
            self.emit(event);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        match self.events_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!(target: "sfu.engine", "Engine event receiver lock poisoned");
                None
            }
        }
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("config", &self.config)
            .field("codecs", &self.capabilities.codecs.len())
            .finish_non_exhaustive()
    }
}
