//! Concurrency tests: many connections negotiating and dropping at once must
//! leave the registry consistent and the engine without leaked handles.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use sfu_coordinator::coordinator::{Coordinator, CoordinatorStats};
use sfu_coordinator::registry::SessionLimits;
use sfu_test_utils::{MockEngine, TestClient};
use signaling_protocol::{MediaKind, ServerMessage, TransportDirection};

const ROOMS: usize = 4;
const CLIENTS_PER_ROOM: usize = 6;

/// Join, publish audio, then consume whatever the join reply listed.
async fn negotiate(coordinator: Coordinator, room: String, user: String) -> TestClient {
    let capabilities = sfu_test_utils::default_capabilities();
    let mut client = TestClient::connect(&coordinator);
    let (_, existing) = client.join(&room, &user).await;

    let send = client.create_transport(TransportDirection::Send).await;
    let recv = client.create_transport(TransportDirection::Recv).await;
    client.drain();
    client
        .send(&signaling_protocol::ClientMessage::Produce {
            transport_id: send,
            kind: MediaKind::Audio,
            rtp_parameters: sfu_test_utils::rtp_parameters_for(MediaKind::Audio),
        })
        .await;

    for producer in existing {
        client
            .send(&signaling_protocol::ClientMessage::Consume {
                transport_id: recv,
                producer_id: producer.producer_id,
                rtp_capabilities: capabilities.clone(),
            })
            .await;
    }
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_and_drops_leave_no_residue() {
    let engine = MockEngine::accepting();
    let coordinator = Coordinator::new(engine.clone(), SessionLimits::default());

    let tasks: Vec<_> = (0..ROOMS * CLIENTS_PER_ROOM)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(negotiate(
                coordinator,
                format!("room-{}", i % ROOMS),
                format!("user-{i}"),
            ))
        })
        .collect();

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    // Skip notifications and consume replies until each produce is answered.
    for client in &mut clients {
        loop {
            match client.recv().await {
                ServerMessage::Produced { .. } => break,
                ServerMessage::Error { error, code } => panic!("request failed: {error} ({code})"),
                _ => {}
            }
        }
    }
    coordinator
        .inspect(|r| r.verify_integrity())
        .await
        .unwrap();

    let stats = coordinator.stats().await;
    assert_eq!(stats.clients, ROOMS * CLIENTS_PER_ROOM);
    assert_eq!(stats.sessions, ROOMS);
    assert_eq!(stats.producers, ROOMS * CLIENTS_PER_ROOM);

    let drops: Vec<_> = clients
        .into_iter()
        .map(|client| tokio::spawn(client.disconnect()))
        .collect();
    for task in drops {
        task.await.unwrap();
    }

    assert_eq!(coordinator.stats().await, CoordinatorStats::default());
    assert_eq!(engine.live_count(), 0);
    coordinator
        .inspect(|r| r.verify_integrity())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drops_during_negotiation_leave_no_residue() {
    let engine = MockEngine::accepting();
    let coordinator = Coordinator::new(engine.clone(), SessionLimits::default());

    let tasks: Vec<_> = (0..ROOMS * CLIENTS_PER_ROOM)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let client = negotiate(coordinator, "shared".to_string(), format!("user-{i}")).await;
                // Drop without waiting for replies.
                client.disconnect().await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(coordinator.stats().await, CoordinatorStats::default());
    assert_eq!(engine.live_count(), 0);
    coordinator
        .inspect(|r| r.verify_integrity())
        .await
        .unwrap();
}
