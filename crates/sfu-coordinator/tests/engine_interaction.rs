//! Tests for the coordinator's handling of the media engine:
//! - Per-call engine failures become local error replies
//! - A disconnect racing an in-flight engine call leaves nothing behind
//! - Engine lifecycle events run the regular cleanup path
//! - Session and capacity limits, draining

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use common::types::{ClientId, ProducerId, SessionId, TransportId};
use sfu_coordinator::actors::EngineEventActor;
use sfu_coordinator::coordinator::Coordinator;
use sfu_coordinator::engine::{EngineError, EngineEvent, EngineHandle, MediaEngine};
use sfu_coordinator::registry::SessionLimits;
use sfu_test_utils::{
    default_capabilities, rtp_parameters_for, EngineCall, MockEngine, TestClient,
};
use signaling_protocol::{ClientMessage, MediaKind, ServerMessage, TransportDirection};
use tokio_util::sync::CancellationToken;

fn coordinator_with(engine: &Arc<MockEngine>) -> Coordinator {
    Coordinator::new(engine.clone(), SessionLimits::default())
}

async fn assert_consistent(coordinator: &Coordinator) {
    coordinator
        .inspect(|registry| registry.verify_integrity())
        .await
        .unwrap();
}

// ============================================================================
// Engine failures
// ============================================================================

#[tokio::test]
async fn test_create_transport_failure_registers_nothing() {
    let engine = MockEngine::builder()
        .fail(
            EngineCall::CreateTransport,
            EngineError::PortsExhausted,
        )
        .build();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;

    let (error, code) = alice
        .request_error(&ClientMessage::CreateTransport {
            direction: TransportDirection::Send,
        })
        .await;

    assert_eq!(error, "Media operation failed");
    assert_eq!(code, 6);
    assert_eq!(coordinator.stats().await.transports, 0);

    engine.clear_failure(EngineCall::CreateTransport);
    alice.create_transport(TransportDirection::Send).await;
    assert_eq!(coordinator.stats().await.transports, 1);
}

#[tokio::test]
async fn test_produce_failure_keeps_peers_quiet() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    let mut bob = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    bob.join("room", "bob").await;
    let send = alice.create_transport(TransportDirection::Send).await;

    engine.set_failure(
        EngineCall::Produce,
        EngineError::Rejected("unsupported codec".to_string()),
    );
    let (error, code) = alice
        .request_error(&ClientMessage::Produce {
            transport_id: send,
            kind: MediaKind::Video,
            rtp_parameters: rtp_parameters_for(MediaKind::Video),
        })
        .await;

    // Engine detail stays server-side.
    assert!(!error.contains("unsupported codec"));
    assert_eq!(code, 6);
    assert_eq!(coordinator.stats().await.producers, 0);
    bob.expect_silence().await;
}

#[tokio::test]
async fn test_connect_and_consume_failures_are_local() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    let mut bob = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    bob.join("room", "bob").await;

    let send = alice.create_transport(TransportDirection::Send).await;
    let producer_id = alice.produce(send, MediaKind::Audio).await;
    bob.recv().await;
    let recv = bob.create_transport(TransportDirection::Recv).await;

    engine.set_failure(EngineCall::ConnectTransport, EngineError::WorkerUnavailable);
    engine.set_failure(EngineCall::Consume, EngineError::WorkerUnavailable);

    let (_, code) = bob
        .request_error(&ClientMessage::ConnectTransport {
            transport_id: recv,
            dtls_parameters: sfu_test_utils::client_dtls_parameters(),
        })
        .await;
    assert_eq!(code, 6);

    let (_, code) = bob
        .request_error(&ClientMessage::Consume {
            transport_id: recv,
            producer_id,
            rtp_capabilities: engine.rtp_capabilities(),
        })
        .await;
    assert_eq!(code, 6);

    assert_eq!(coordinator.stats().await.consumers, 0);
    alice.expect_silence().await;
    assert_consistent(&coordinator).await;
}

#[tokio::test]
async fn test_unconsumable_producer_never_reaches_engine_consume() {
    let engine = MockEngine::builder().unconsumable().build();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    let send = alice.create_transport(TransportDirection::Send).await;
    let recv = alice.create_transport(TransportDirection::Recv).await;
    let producer_id = alice.produce(send, MediaKind::Audio).await;

    let (error, code) = alice
        .request_error(&ClientMessage::Consume {
            transport_id: recv,
            producer_id,
            rtp_capabilities: engine.rtp_capabilities(),
        })
        .await;

    assert_eq!(error, "Cannot consume");
    assert_eq!(code, 1);
    assert_eq!(engine.call_count(EngineCall::Consume), 0);
}

// ============================================================================
// Disconnect racing in-flight engine calls
// ============================================================================

#[tokio::test]
async fn test_disconnect_during_produce_closes_new_producer() {
    let engine = MockEngine::builder().gate(EngineCall::Produce).build();
    let gate = engine.gate(EngineCall::Produce).unwrap();
    let coordinator = coordinator_with(&engine);

    let mut alice = TestClient::connect(&coordinator);
    let mut bob = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    bob.join("room", "bob").await;
    let send = alice.create_transport(TransportDirection::Send).await;

    alice
        .send(&ClientMessage::Produce {
            transport_id: send,
            kind: MediaKind::Video,
            rtp_parameters: rtp_parameters_for(MediaKind::Video),
        })
        .await;
    gate.entered().await;

    // Connection drops while the engine call is suspended.
    alice.handle().disconnect().await;
    assert_eq!(coordinator.stats().await.clients, 1);
    gate.release();

    match alice.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 4),
        other => panic!("expected error reply, got {other:?}"),
    }

    let stats = coordinator.stats().await;
    assert_eq!((stats.transports, stats.producers), (0, 0));
    assert_eq!(engine.live_count(), 0, "late producer handle was closed");
    assert!(engine
        .closed()
        .iter()
        .any(|h| matches!(h, EngineHandle::Producer(_))));
    bob.expect_silence().await;
    assert_consistent(&coordinator).await;
}

#[tokio::test]
async fn test_disconnect_during_create_transport_closes_new_transport() {
    let engine = MockEngine::builder()
        .gate(EngineCall::CreateTransport)
        .build();
    let gate = engine.gate(EngineCall::CreateTransport).unwrap();
    let coordinator = coordinator_with(&engine);

    let mut alice = TestClient::connect(&coordinator);
    let (alice_id, _) = alice.join("room", "alice").await;
    alice
        .send(&ClientMessage::CreateTransport {
            direction: TransportDirection::Recv,
        })
        .await;
    gate.entered().await;

    assert!(coordinator.disconnect(alice_id).await);
    gate.release();
    alice.recv().await;

    assert_eq!(coordinator.stats().await, Default::default());
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test]
async fn test_concurrent_disconnects_are_idempotent() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    let (alice_id, _) = alice.join("room", "alice").await;
    let send = alice.create_transport(TransportDirection::Send).await;
    alice.produce(send, MediaKind::Audio).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.disconnect(alice_id).await })
        })
        .collect();

    let mut removed = 0;
    for task in tasks {
        if task.await.unwrap() {
            removed += 1;
        }
    }
    assert_eq!(removed, 1);
    assert_eq!(engine.call_count(EngineCall::Close), 2);
    assert_consistent(&coordinator).await;
}

// ============================================================================
// Producer closing while a consume is in flight
// ============================================================================

/// Alice publishes video, Bob opens a receive transport and sends `consume`.
/// Returns once the engine consume call is held at its gate.
async fn consume_in_flight(
    engine: &Arc<MockEngine>,
    coordinator: &Coordinator,
) -> (TestClient, TestClient, ClientId, ProducerId) {
    let mut alice = TestClient::connect(coordinator);
    let mut bob = TestClient::connect(coordinator);
    let (alice_id, _) = alice.join("room", "alice").await;
    bob.join("room", "bob").await;

    let send = alice.create_transport(TransportDirection::Send).await;
    let producer_id = alice.produce(send, MediaKind::Video).await;
    assert!(matches!(
        bob.recv().await,
        ServerMessage::NewProducer { .. }
    ));
    let recv = bob.create_transport(TransportDirection::Recv).await;

    bob.send(&ClientMessage::Consume {
        transport_id: recv,
        producer_id,
        rtp_capabilities: default_capabilities(),
    })
    .await;
    engine.gate(EngineCall::Consume).unwrap().entered().await;

    (alice, bob, alice_id, producer_id)
}

#[tokio::test]
async fn test_producer_closed_during_consume_engine_rejects() {
    let engine = MockEngine::builder().gate(EngineCall::Consume).build();
    let coordinator = coordinator_with(&engine);
    let (_alice, mut bob, alice_id, producer_id) = consume_in_flight(&engine, &coordinator).await;

    // The engine forgets the producer before the consume call resumes.
    let errors = coordinator
        .close(alice_id, None, Some(producer_id), None)
        .await;
    assert!(errors.is_empty());
    engine.gate(EngineCall::Consume).unwrap().release();

    assert_eq!(
        bob.recv().await,
        ServerMessage::ProducerClosed {
            producer_id,
            client_id: alice_id,
        }
    );
    match bob.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 6),
        other => panic!("expected error reply, got {other:?}"),
    }

    assert_eq!(coordinator.stats().await.consumers, 0);
    assert!(!engine
        .closed()
        .iter()
        .any(|h| matches!(h, EngineHandle::Consumer(_))));
    assert_consistent(&coordinator).await;
}

#[tokio::test]
async fn test_producer_closed_during_consume_late_consumer_is_discarded() {
    let engine = MockEngine::builder()
        .gate(EngineCall::Consume)
        .gate(EngineCall::Close)
        .build();
    let coordinator = coordinator_with(&engine);
    let (_alice, mut bob, alice_id, producer_id) = consume_in_flight(&engine, &coordinator).await;
    let live_before = engine.live_count();
    let close_gate = engine.gate(EngineCall::Close).unwrap();

    // Registry drops the producer; the engine still holds it while the
    // producer close is parked at its gate.
    let closer = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .close(alice_id, None, Some(producer_id), None)
                .await
        }
    });
    close_gate.entered().await;
    assert_eq!(coordinator.stats().await.producers, 0);

    // The engine hands back a consumer for a producer the registry no longer has.
    engine.gate(EngineCall::Consume).unwrap().release();
    close_gate.release();
    close_gate.release();

    assert_eq!(
        bob.recv().await,
        ServerMessage::ProducerClosed {
            producer_id,
            client_id: alice_id,
        }
    );
    match bob.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 4),
        other => panic!("expected error reply, got {other:?}"),
    }
    assert!(closer.await.unwrap().is_empty());

    assert_eq!(coordinator.stats().await.consumers, 0);
    assert!(engine
        .closed()
        .iter()
        .any(|h| matches!(h, EngineHandle::Consumer(_))));
    assert_eq!(
        engine.live_count(),
        live_before - 1,
        "only the producer left the engine; the late consumer was closed"
    );
    assert_consistent(&coordinator).await;
}

// ============================================================================
// Engine lifecycle events
// ============================================================================

fn spawn_event_actor(
    engine: &Arc<MockEngine>,
    coordinator: &Coordinator,
) -> (CancellationToken, CancellationToken) {
    let events = engine.take_events().unwrap();
    let cancel = CancellationToken::new();
    let fatal = CancellationToken::new();
    EngineEventActor::spawn(coordinator.clone(), events, cancel.clone(), fatal.clone());
    (cancel, fatal)
}

async fn eventually<F>(coordinator: &Coordinator, check: F)
where
    F: Fn(&sfu_coordinator::registry::EntityRegistry) -> bool + Copy,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        while !coordinator.inspect(check).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_transport_closed_event_cascades_to_peers() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let (_cancel, fatal) = spawn_event_actor(&engine, &coordinator);

    let mut alice = TestClient::connect(&coordinator);
    let mut bob = TestClient::connect(&coordinator);
    let (alice_id, _) = alice.join("room", "alice").await;
    bob.join("room", "bob").await;
    let send = alice.create_transport(TransportDirection::Send).await;
    let producer_id = alice.produce(send, MediaKind::Video).await;
    bob.recv().await;
    let recv = bob.create_transport(TransportDirection::Recv).await;
    let consumer_id = bob
        .consume(recv, producer_id, engine.rtp_capabilities())
        .await;

    engine.emit(EngineEvent::TransportClosed { transport_id: send });

    let mut received = vec![bob.recv().await, bob.recv().await];
    received.sort_by_key(|m| m.message_type());
    assert_eq!(
        received,
        vec![
            ServerMessage::ConsumerClosed {
                consumer_id,
                producer_id,
            },
            ServerMessage::ProducerClosed {
                producer_id,
                client_id: alice_id,
            },
        ]
    );

    let stats = coordinator.stats().await;
    assert_eq!((stats.clients, stats.transports), (2, 1));
    assert_eq!((stats.producers, stats.consumers), (0, 0));
    assert!(!fatal.is_cancelled());
    assert_consistent(&coordinator).await;
}

#[tokio::test]
async fn test_consumer_producer_closed_event_notifies_owner() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let (_cancel, _fatal) = spawn_event_actor(&engine, &coordinator);

    let mut alice = TestClient::connect(&coordinator);
    let mut bob = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    bob.join("room", "bob").await;
    let send = alice.create_transport(TransportDirection::Send).await;
    let producer_id = alice.produce(send, MediaKind::Audio).await;
    bob.recv().await;
    let recv = bob.create_transport(TransportDirection::Recv).await;
    let consumer_id = bob
        .consume(recv, producer_id, engine.rtp_capabilities())
        .await;

    engine.emit(EngineEvent::ConsumerProducerClosed { consumer_id });

    assert_eq!(
        bob.recv().await,
        ServerMessage::ConsumerClosed {
            consumer_id,
            producer_id,
        }
    );
    eventually(&coordinator, |r| r.consumer_count() == 0).await;
    assert_eq!(coordinator.stats().await.producers, 1);
    alice.expect_silence().await;
}

#[tokio::test]
async fn test_events_for_unknown_ids_are_ignored() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);

    assert!(
        !coordinator
            .handle_engine_event(EngineEvent::TransportClosed {
                transport_id: TransportId::new(),
            })
            .await
    );
    assert!(
        !coordinator
            .handle_engine_event(EngineEvent::ProducerClosed {
                producer_id: ProducerId::new(),
            })
            .await
    );
    assert_eq!(engine.call_count(EngineCall::Close), 0);
}

#[tokio::test]
async fn test_event_after_explicit_close_is_harmless() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;
    let send = alice.create_transport(TransportDirection::Send).await;
    let producer_id = alice.produce(send, MediaKind::Audio).await;

    alice
        .send(&ClientMessage::Close {
            consumer_id: None,
            producer_id: Some(producer_id),
            transport_id: None,
        })
        .await;
    eventually(&coordinator, |r| r.producer_count() == 0).await;

    assert!(
        !coordinator
            .handle_engine_event(EngineEvent::ProducerClosed { producer_id })
            .await
    );
    // Closing an already-removed id is silently ignored.
    alice
        .send(&ClientMessage::Close {
            consumer_id: None,
            producer_id: Some(producer_id),
            transport_id: None,
        })
        .await;
    alice.expect_silence().await;
    assert_consistent(&coordinator).await;
}

#[tokio::test]
async fn test_worker_death_is_fatal() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let (_cancel, fatal) = spawn_event_actor(&engine, &coordinator);

    engine.emit(EngineEvent::WorkerDied {
        reason: "killed".to_string(),
    });

    tokio::time::timeout(Duration::from_secs(1), fatal.cancelled())
        .await
        .expect("fatal token cancelled");
}

// ============================================================================
// Limits and draining
// ============================================================================

#[tokio::test]
async fn test_session_participant_limit() {
    let engine = MockEngine::accepting();
    let coordinator = Coordinator::new(
        engine,
        SessionLimits {
            max_sessions: 10,
            max_participants_per_session: 2,
        },
    );

    let mut a = TestClient::connect(&coordinator);
    let mut b = TestClient::connect(&coordinator);
    let mut c = TestClient::connect(&coordinator);
    a.join("room", "a").await;
    b.join("room", "b").await;

    let (error, code) = c
        .request_error(&sfu_test_utils::join_message("room", "c"))
        .await;
    assert_eq!(error, "Session is full");
    assert_eq!(code, 7);

    // Another session still has room, and the rejected connection may retry.
    c.join("other", "c").await;
}

#[tokio::test]
async fn test_session_count_limit() {
    let engine = MockEngine::accepting();
    let coordinator = Coordinator::new(
        engine,
        SessionLimits {
            max_sessions: 1,
            max_participants_per_session: 10,
        },
    );

    let mut a = TestClient::connect(&coordinator);
    let mut b = TestClient::connect(&coordinator);
    a.join("first", "a").await;

    let (_, code) = b
        .request_error(&sfu_test_utils::join_message("second", "b"))
        .await;
    assert_eq!(code, 7);
    b.join("first", "b").await;

    assert!(
        coordinator
            .inspect(|r| r.session(&SessionId::from("second")).is_none())
            .await
    );
}

#[tokio::test]
async fn test_draining_rejects_new_joins_only() {
    let engine = MockEngine::accepting();
    let coordinator = coordinator_with(&engine);
    let mut alice = TestClient::connect(&coordinator);
    alice.join("room", "alice").await;

    coordinator.begin_drain();
    assert!(coordinator.is_draining());

    let mut bob = TestClient::connect(&coordinator);
    let (_, code) = bob
        .request_error(&sfu_test_utils::join_message("room", "bob"))
        .await;
    assert_eq!(code, 7);

    // Joined clients keep working.
    alice.create_transport(TransportDirection::Send).await;
}
