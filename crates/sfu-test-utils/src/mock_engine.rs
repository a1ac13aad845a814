//! Mock media engine for coordinator testing.
//!
//! Provides a [`MediaEngine`] implementation that can be configured to:
//! - Fail specific calls
//! - Report every producer as unconsumable
//! - Hold a call until the test releases it (for interleaving races)
//! - Emit lifecycle events on demand
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::{EngineCall, MockEngine};
//!
//! let engine = MockEngine::builder()
//!     .fail(EngineCall::Produce, EngineError::WorkerUnavailable)
//!     .build();
//!
//! let coordinator = Coordinator::new(engine.clone(), SessionLimits::default());
//! ```

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use sfu_coordinator::engine::{
    ConsumerInfo, EngineError, EngineEvent, EngineHandle, MediaEngine, TransportInfo,
};
use signaling_protocol::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpParameters, SctpParameters, TransportDirection,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};

/// Engine capability invoked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCall {
    CreateTransport,
    ConnectTransport,
    Produce,
    CanConsume,
    Consume,
    Pause,
    Resume,
    Close,
}

/// Holds a gated call until [`CallGate::release`] is called.
#[derive(Debug)]
pub struct CallGate {
    entered: Notify,
    release: Semaphore,
}

impl CallGate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a call reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let one held call continue.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    failures: HashMap<EngineCall, EngineError>,
    unconsumable: bool,
    calls: Vec<EngineCall>,
    closed: Vec<EngineHandle>,
    live: HashSet<EngineHandle>,
    producers: HashMap<ProducerId, MediaKind>,
    paused: HashSet<EngineHandle>,
}

/// Scriptable [`MediaEngine`].
#[derive(Debug)]
pub struct MockEngine {
    capabilities: RtpCapabilities,
    state: Mutex<MockState>,
    gates: HashMap<EngineCall, Arc<CallGate>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl MockEngine {
    /// Create a new `MockEngine` builder.
    #[must_use]
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    /// Engine that accepts every call.
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Self::builder().build()
    }

    /// Make `call` fail with `error` until cleared.
    pub fn set_failure(&self, call: EngineCall, error: EngineError) {
        self.lock().failures.insert(call, error);
    }

    /// Let `call` succeed again.
    pub fn clear_failure(&self, call: EngineCall) {
        self.lock().failures.remove(&call);
    }

    /// Report every producer as unconsumable (or consumable again).
    pub fn set_unconsumable(&self, unconsumable: bool) {
        self.lock().unconsumable = unconsumable;
    }

    /// Gate installed for `call`, if any.
    #[must_use]
    pub fn gate(&self, call: EngineCall) -> Option<Arc<CallGate>> {
        self.gates.get(&call).cloned()
    }

    /// Push a lifecycle event as if the engine raised it.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Number of times `call` was made.
    #[must_use]
    pub fn call_count(&self, call: EngineCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Every handle passed to `close`, in order.
    #[must_use]
    pub fn closed(&self) -> Vec<EngineHandle> {
        self.lock().closed.clone()
    }

    /// Whether `handle` was created and not closed.
    #[must_use]
    pub fn is_live(&self, handle: EngineHandle) -> bool {
        self.lock().live.contains(&handle)
    }

    /// Number of created handles not yet closed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether `handle` is currently paused in the engine.
    #[must_use]
    pub fn is_paused(&self, handle: EngineHandle) -> bool {
        self.lock().paused.contains(&handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record the call, wait at its gate, then return the scripted failure.
    async fn enter(&self, call: EngineCall) -> Result<(), EngineError> {
        self.lock().calls.push(call);
        if let Some(gate) = self.gates.get(&call) {
            gate.pass().await;
        }
        match self.lock().failures.get(&call) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn require_live(state: &MockState, handle: EngineHandle) -> Result<(), EngineError> {
        if state.live.contains(&handle) {
            Ok(())
        } else {
            Err(EngineError::UnknownHandle(handle))
        }
    }
}

/// Builder for [`MockEngine`].
#[derive(Debug, Default)]
pub struct MockEngineBuilder {
    failures: HashMap<EngineCall, EngineError>,
    gated: HashSet<EngineCall>,
    unconsumable: bool,
    capabilities: Option<RtpCapabilities>,
}

impl MockEngineBuilder {
    /// Fail `call` with `error`.
    #[must_use]
    pub fn fail(mut self, call: EngineCall, error: EngineError) -> Self {
        self.failures.insert(call, error);
        self
    }

    /// Hold every `call` at a [`CallGate`].
    #[must_use]
    pub fn gate(mut self, call: EngineCall) -> Self {
        self.gated.insert(call);
        self
    }

    /// Report every producer as unconsumable.
    #[must_use]
    pub fn unconsumable(mut self) -> Self {
        self.unconsumable = true;
        self
    }

    /// Override the router capabilities.
    #[must_use]
    pub fn capabilities(mut self, capabilities: RtpCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Build the engine.
    #[must_use]
    pub fn build(self) -> Arc<MockEngine> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gates = self
            .gated
            .into_iter()
            .map(|call| (call, Arc::new(CallGate::new())))
            .collect();

        Arc::new(MockEngine {
            capabilities: self.capabilities.unwrap_or_else(default_capabilities),
            state: Mutex::new(MockState {
                failures: self.failures,
                unconsumable: self.unconsumable,
                ..MockState::default()
            }),
            gates,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

/// Opus plus VP8 with fixed payload types.
#[must_use]
pub fn default_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
            },
        ],
        header_extensions: Vec::new(),
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.enter(EngineCall::CreateTransport).await?;

        let id = TransportId::new();
        let mut state = self.lock();
        state.live.insert(EngineHandle::Transport(id));

        Ok(TransportInfo {
            id,
            ice_parameters: IceParameters {
                username_fragment: "mockufrag".to_string(),
                password: "mockpassword".to_string(),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: "127.0.0.1".to_string(),
                protocol: "udp".to_string(),
                port: 40000,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AA:BB:CC".to_string(),
                }],
            },
            sctp_parameters: (direction == TransportDirection::Send).then_some(SctpParameters {
                port: 5000,
                os: 1024,
                mis: 1024,
                max_message_size: 262_144,
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(EngineCall::ConnectTransport).await?;
        Self::require_live(&self.lock(), EngineHandle::Transport(transport_id))
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        // Validated on entry; a transport closed while the call is held does
        // not stop the producer from being created.
        Self::require_live(&self.lock(), EngineHandle::Transport(transport_id))?;
        self.enter(EngineCall::Produce).await?;

        let mut state = self.lock();
        let id = ProducerId::new();
        state.live.insert(EngineHandle::Producer(id));
        state.producers.insert(id, kind);
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: ProducerId,
        _rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        if self.enter(EngineCall::CanConsume).await.is_err() {
            return false;
        }
        let state = self.lock();
        !state.unconsumable && state.producers.contains_key(&producer_id)
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        _rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        Self::require_live(&self.lock(), EngineHandle::Transport(transport_id))?;
        self.enter(EngineCall::Consume).await?;

        let mut state = self.lock();
        let kind = *state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownHandle(EngineHandle::Producer(
                producer_id,
            )))?;

        let id = ConsumerId::new();
        state.live.insert(EngineHandle::Consumer(id));
        state.paused.insert(EngineHandle::Consumer(id));

        Ok(ConsumerInfo {
            id,
            producer_id,
            kind,
            rtp_parameters: RtpParameters {
                mid: Some("0".to_string()),
                ..RtpParameters::default()
            },
            paused: true,
        })
    }

    async fn pause(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.enter(EngineCall::Pause).await?;
        let mut state = self.lock();
        Self::require_live(&state, handle)?;
        state.paused.insert(handle);
        Ok(())
    }

    async fn resume(&self, handle: EngineHandle) -> Result<(), EngineError> {
        self.enter(EngineCall::Resume).await?;
        let mut state = self.lock();
        Self::require_live(&state, handle)?;
        state.paused.remove(&handle);
        Ok(())
    }

    async fn close(&self, handle: EngineHandle) {
        let _ = self.enter(EngineCall::Close).await;
        let mut state = self.lock();
        state.closed.push(handle);
        state.live.remove(&handle);
        state.paused.remove(&handle);
        match handle {
            EngineHandle::Producer(id) => {
                state.producers.remove(&id);
            }
            EngineHandle::Transport(_) | EngineHandle::Consumer(_) => {}
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failure_and_call_log() {
        let engine = MockEngine::builder()
            .fail(EngineCall::Produce, EngineError::WorkerUnavailable)
            .build();

        let transport = engine
            .create_transport(TransportDirection::Send)
            .await
            .unwrap();
        let result = engine
            .produce(transport.id, MediaKind::Audio, RtpParameters::default())
            .await;

        assert_eq!(result, Err(EngineError::WorkerUnavailable));
        assert_eq!(
            engine.calls(),
            vec![EngineCall::CreateTransport, EngineCall::Produce]
        );

        engine.clear_failure(EngineCall::Produce);
        assert!(engine
            .produce(transport.id, MediaKind::Audio, RtpParameters::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_tracks_live_handles() {
        let engine = MockEngine::accepting();
        let transport = engine
            .create_transport(TransportDirection::Recv)
            .await
            .unwrap();
        assert!(transport.sctp_parameters.is_none());

        let handle = EngineHandle::Transport(transport.id);
        assert!(engine.is_live(handle));
        engine.close(handle).await;
        assert!(!engine.is_live(handle));
        assert_eq!(engine.closed(), vec![handle]);
    }

    #[tokio::test]
    async fn test_gate_holds_call_until_released() {
        let engine = MockEngine::builder().gate(EngineCall::CreateTransport).build();
        let gate = engine.gate(EngineCall::CreateTransport).unwrap();

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.create_transport(TransportDirection::Send).await })
        };

        gate.entered().await;
        assert_eq!(engine.live_count(), 0);
        gate.release();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(engine.live_count(), 1);
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let engine = MockEngine::accepting();
        let mut events = engine.take_events().unwrap();
        assert!(engine.take_events().is_none());

        engine.emit(EngineEvent::WorkerDied {
            reason: "test".to_string(),
        });
        assert!(matches!(
            events.recv().await,
            Some(EngineEvent::WorkerDied { .. })
        ));
    }
}
