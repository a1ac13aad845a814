//! Test fixtures for coordinator testing.
//!
//! Provides:
//! - [`TestClient`], a signaling connection driven over in-memory channels
//! - Message payload builders (RTP parameters, capabilities, DTLS parameters)

use common::types::{ClientId, ConsumerId, ProducerId, SessionId, TransportId};
use serde_json::{json, Map, Value};
use sfu_coordinator::actors::{ActorMetrics, ConnectionActor, ConnectionActorHandle};
use sfu_coordinator::coordinator::Coordinator;
use signaling_protocol::{
    encode_client_message, ClientMessage, DtlsFingerprint, DtlsParameters, MediaKind,
    ProducerSummary, RtpCapabilities, RtpCodecParameters, RtpParameters, ServerMessage,
    TransportDirection,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long [`TestClient::recv`] waits for a message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long [`TestClient::expect_silence`] listens.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(50);

/// Outbound queue capacity of a test connection.
const OUTBOUND_CAPACITY: usize = 256;

/// A client connection talking to a real `ConnectionActor`.
///
/// Frames are encoded exactly as a remote client would send them; replies and
/// notifications are collected from the connection's outbound queue.
pub struct TestClient {
    handle: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    outbound: mpsc::Receiver<ServerMessage>,
}

impl TestClient {
    /// Open a connection to `coordinator`.
    #[must_use]
    pub fn connect(coordinator: &Coordinator) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (handle, task) = ConnectionActor::spawn(
            coordinator.clone(),
            tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        Self {
            handle,
            task: Some(task),
            outbound: rx,
        }
    }

    /// The actor handle behind this client.
    #[must_use]
    pub fn handle(&self) -> &ConnectionActorHandle {
        &self.handle
    }

    /// Client id assigned by join, if joined.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.handle.client_id()
    }

    /// Send a message as one text frame.
    pub async fn send(&self, message: &ClientMessage) {
        let text = encode_client_message(message).expect("client message encodes");
        self.send_raw(text).await;
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: impl Into<String>) {
        self.handle
            .deliver_frame(text.into())
            .await
            .expect("connection actor accepts frames");
    }

    /// Next message for this client. Panics after [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("outbound queue closed")
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.outbound.try_recv().ok()
    }

    /// Every message already queued.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Assert nothing arrives within [`SILENCE_WINDOW`].
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(message)) = tokio::time::timeout(SILENCE_WINDOW, self.outbound.recv()).await
        {
            panic!("expected no message, got {message:?}");
        }
    }

    /// Send `message` and return the next message received.
    pub async fn request(&mut self, message: &ClientMessage) -> ServerMessage {
        self.send(message).await;
        self.recv().await
    }

    /// Send `message` and return the `(error, code)` reply.
    pub async fn request_error(&mut self, message: &ClientMessage) -> (String, i32) {
        match self.request(message).await {
            ServerMessage::Error { error, code } => (error, code),
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    /// Join `session_id` as `user_id`.
    pub async fn join(&mut self, session_id: &str, user_id: &str) -> (ClientId, Vec<ProducerSummary>) {
        match self.request(&join_message(session_id, user_id)).await {
            ServerMessage::RouterRtpCapabilities {
                client_id,
                producers,
                ..
            } => (client_id, producers),
            other => panic!("expected routerRtpCapabilities, got {other:?}"),
        }
    }

    /// Create a transport in `direction`.
    pub async fn create_transport(&mut self, direction: TransportDirection) -> TransportId {
        match self
            .request(&ClientMessage::CreateTransport { direction })
            .await
        {
            ServerMessage::TransportCreated { transport_id, .. } => transport_id,
            other => panic!("expected transportCreated, got {other:?}"),
        }
    }

    /// Connect `transport_id` with sample DTLS parameters.
    pub async fn connect_transport(&mut self, transport_id: TransportId) {
        let reply = self
            .request(&ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters: client_dtls_parameters(),
            })
            .await;
        assert_eq!(reply, ServerMessage::TransportConnected { transport_id });
    }

    /// Produce a stream of `kind` on `transport_id`.
    pub async fn produce(&mut self, transport_id: TransportId, kind: MediaKind) -> ProducerId {
        match self
            .request(&ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters: rtp_parameters_for(kind),
            })
            .await
        {
            ServerMessage::Produced { producer_id, .. } => producer_id,
            other => panic!("expected produced, got {other:?}"),
        }
    }

    /// Consume `producer_id` on `transport_id` with `rtp_capabilities`.
    pub async fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> ConsumerId {
        match self
            .request(&ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            })
            .await
        {
            ServerMessage::Consumed {
                consumer_id,
                paused,
                ..
            } => {
                assert!(paused, "consumers start paused");
                consumer_id
            }
            other => panic!("expected consumed, got {other:?}"),
        }
    }

    /// Drop the connection the way the server does when the socket closes.
    pub async fn disconnect(mut self) {
        self.handle.disconnect().await;
        if let Some(task) = self.task.take() {
            task.await.expect("connection actor exits cleanly");
        }
    }
}

/// `join` message carrying a display name.
#[must_use]
pub fn join_message(session_id: &str, user_id: &str) -> ClientMessage {
    ClientMessage::Join {
        session_id: SessionId::from(session_id),
        user_id: user_id.to_string(),
        user_info: json!({ "displayName": user_id }),
    }
}

/// DTLS parameters a browser would send.
#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some("client".to_string()),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "01:02:03:04".to_string(),
        }],
    }
}

/// Single-codec RTP parameters (Opus for audio, VP8 for video).
#[must_use]
pub fn rtp_parameters_for(kind: MediaKind) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        },
        MediaKind::Video => RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        },
    };

    let mut extra = Map::new();
    extra.insert(
        "encodings".to_string(),
        Value::Array(vec![json!({ "ssrc": 1111 })]),
    );

    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![codec],
        extra,
    }
}

/// Capabilities with no codecs; nothing can be consumed with these.
#[must_use]
pub fn empty_capabilities() -> RtpCapabilities {
    RtpCapabilities::default()
}
