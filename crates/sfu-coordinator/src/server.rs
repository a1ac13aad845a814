//! WebSocket signaling server.
//!
//! One route upgrades to a WebSocket. Each socket gets:
//! - a bounded outbound queue drained by a writer task
//! - a [`ConnectionActor`] fed with the socket's text frames
//!
//! When the socket closes (or the server shuts down) the actor handle's
//! `disconnect` runs, which removes the client from the coordinator.

use crate::actors::{ActorMetrics, ActorType, ConnectionActor};
use crate::coordinator::Coordinator;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use signaling_protocol::{encode_server_message, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Shared state of the signaling server.
#[derive(Debug, Clone)]
pub struct SignalingState {
    pub coordinator: Coordinator,
    pub metrics: Arc<ActorMetrics>,
    pub max_connections: usize,
    /// Parent of every connection's token.
    pub shutdown: CancellationToken,
}

/// Create the signaling router serving WebSocket upgrades at `ws_path`.
pub fn signaling_router(state: SignalingState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Releases a connection slot when dropped, including when the upgrade
/// never completes.
struct ConnectionSlot {
    metrics: Arc<ActorMetrics>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
}

async fn ws_handler(
    State(state): State<SignalingState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    if !state.metrics.try_connection_created(state.max_connections) {
        warn!(
            target: "sfu.server",
            max_connections = state.max_connections,
            "Connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    let slot = ConnectionSlot {
        metrics: Arc::clone(&state.metrics),
    };

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: SignalingState, slot: ConnectionSlot) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAPACITY);
    let cancel_token = state.shutdown.child_token();

    let (handle, actor_task) = ConnectionActor::spawn(
        state.coordinator.clone(),
        outbound_tx,
        cancel_token.clone(),
        Arc::clone(&state.metrics),
    );
    let connection_id = handle.connection_id().to_string();

    info!(
        target: "sfu.server",
        connection_id = %connection_id,
        "WebSocket connection opened"
    );

    // Ends once the actor (sole strong sender) has stopped and the queue is drained.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match encode_server_message(&message) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(
                    target: "sfu.server",
                    error = %e,
                    message_type = message.message_type(),
                    "Failed to encode server message"
                ),
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.server",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket receive failed"
                        );
                        break;
                    }
                };

                if handle.deliver_frame(text).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.disconnect().await;

    match actor_task.await {
        Err(e) if e.is_panic() => state.metrics.record_panic(ActorType::Connection),
        _ => {}
    }
    let _ = writer.await;
    drop(slot);

    info!(
        target: "sfu.server",
        connection_id = %connection_id,
        "WebSocket connection closed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, LocalEngineConfig};
    use crate::registry::SessionLimits;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn state(max_connections: usize) -> SignalingState {
        let engine = Arc::new(LocalEngine::new(LocalEngineConfig::default()).unwrap());
        SignalingState {
            coordinator: Coordinator::new(engine, SessionLimits::default()),
            metrics: ActorMetrics::new(),
            max_connections,
            shutdown: CancellationToken::new(),
        }
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("Failed to build request")
    }

    #[tokio::test]
    async fn test_connection_limit_returns_503() {
        let app = signaling_router(state(0), "/sfu");

        let response = app.oneshot(request("/sfu")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"connection limit reached");
    }

    #[tokio::test]
    async fn test_plain_request_requires_upgrade_and_releases_slot() {
        let state = state(1);
        let metrics = Arc::clone(&state.metrics);
        let app = signaling_router(state, "/sfu");

        let response = app.oneshot(request("/sfu")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_upgrades() {
        let state = state(10);
        state.shutdown.cancel();
        let app = signaling_router(state, "/sfu");

        let response = app.oneshot(request("/sfu")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_other_paths_are_not_found() {
        let app = signaling_router(state(10), "/signal");

        let response = app.oneshot(request("/sfu")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
