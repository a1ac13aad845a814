//! `ConnectionActor` - per-connection signaling dispatcher.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one signaling connection
//! - Decodes inbound frames and processes them strictly in arrival order
//! - Tracks whether the connection has joined and as which client
//! - Replies through the connection's outbound queue
//!
//! # Lifecycle
//!
//! 1. Spawned when the WebSocket upgrade completes
//! 2. Runs until its mailbox closes or its token is cancelled
//! 3. On exit, disconnects its client from the coordinator
//!
//! [`ConnectionActorHandle::disconnect`] removes the client immediately, even
//! while a request is still in flight; the in-flight request then finds its
//! client gone and cleans up after itself.

use crate::coordinator::{Coordinator, Replies};
use crate::errors::SfuError;
use crate::fanout::ConnectionHandle;
use crate::observability::metrics as sfu_metrics;

use super::messages::{ConnectionMessage, ConnectionStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ClientId, SessionId};
use serde_json::Value;
use signaling_protocol::{decode_client_message, ClientMessage, ServerMessage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    client_id: watch::Receiver<Option<ClientId>>,
    coordinator: Coordinator,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Client id assigned by a successful join, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        *self.client_id.borrow()
    }

    /// Queue an inbound text frame. Frames are handled in the order queued.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn deliver_frame(&self, text: String) -> Result<(), SfuError> {
        if let Err(e) = self.sender.send(ConnectionMessage::Frame { text }).await {
            self.mailbox.record_drop();
            return Err(SfuError::Internal(format!("channel send failed: {e}")));
        }
        self.mailbox.record_enqueue();
        Ok(())
    }

    /// Query the actor's state. Answered after every frame queued before it.
    ///
    /// # Errors
    ///
    /// `Internal` if the actor has stopped.
    pub async fn status(&self) -> Result<ConnectionStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Connection dropped: remove the client now and stop the actor.
    ///
    /// Idempotent, and safe while a request of this client is in flight.
    pub async fn disconnect(&self) {
        self.cancel_token.cancel();
        if let Some(client_id) = self.client_id() {
            self.coordinator.disconnect(client_id).await;
        }
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    coordinator: Coordinator,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Strong end of the outbound queue; the registry only keeps a weak one.
    outbound: mpsc::Sender<ServerMessage>,
    client_id: Option<ClientId>,
    client_id_tx: watch::Sender<Option<ClientId>>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor replying through `outbound`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        coordinator: Coordinator,
        outbound: mpsc::Sender<ServerMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let connection_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (client_id_tx, client_id_rx) = watch::channel(None);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let actor = Self {
            connection_id: connection_id.clone(),
            coordinator: coordinator.clone(),
            receiver,
            outbound,
            client_id: None,
            client_id_tx,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            client_id: client_id_rx,
            coordinator,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        if let Some(client_id) = self.client_id {
            self.coordinator.disconnect(client_id).await;
        }

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            client_id = ?self.client_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "ConnectionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ConnectionMessage) {
        match message {
            ConnectionMessage::Frame { text } => {
                self.mailbox.record_dequeue();
                self.handle_frame(&text).await;
            }
            ConnectionMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(ConnectionStatus {
                    client_id: self.client_id,
                    frames_processed: self.mailbox.messages_processed(),
                });
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let started = Instant::now();

        let (message_type, replies) = match decode_client_message(text) {
            Ok(message) => {
                let message_type = message.message_type();
                (message_type, self.dispatch(message).await)
            }
            Err(e) => ("invalid", vec![Err(SfuError::from(e))]),
        };

        sfu_metrics::record_message(message_type);
        for reply in replies {
            self.reply(message_type, reply).await;
        }
        sfu_metrics::record_message_latency(message_type, started.elapsed());
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Replies {
        match (self.client_id, message) {
            (
                None,
                ClientMessage::Join {
                    session_id,
                    user_id,
                    user_info,
                },
            ) => vec![self.join(session_id, user_id, user_info).await],
            (None, _) => vec![Err(SfuError::NotJoined)],
            (Some(client_id), message) => self.dispatch_joined(client_id, message).await,
        }
    }

    async fn join(
        &mut self,
        session_id: SessionId,
        user_id: String,
        user_info: Value,
    ) -> Result<ServerMessage, SfuError> {
        let connection = ConnectionHandle::new(&self.outbound);
        let (client_id, reply) = self
            .coordinator
            .join(connection, session_id, user_id, user_info)
            .await?;

        self.client_id = Some(client_id);
        self.client_id_tx.send_replace(Some(client_id));
        Ok(reply)
    }

    async fn dispatch_joined(&self, client_id: ClientId, message: ClientMessage) -> Replies {
        let coordinator = &self.coordinator;
        match message {
            ClientMessage::Join { .. } => vec![Err(SfuError::AlreadyJoined)],
            ClientMessage::CreateTransport { direction } => {
                vec![coordinator.create_transport(client_id, direction).await]
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => vec![
                coordinator
                    .connect_transport(client_id, transport_id, dtls_parameters)
                    .await,
            ],
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => vec![
                coordinator
                    .produce(client_id, transport_id, kind, rtp_parameters)
                    .await,
            ],
            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => vec![
                coordinator
                    .consume(client_id, transport_id, producer_id, rtp_capabilities)
                    .await,
            ],
            ClientMessage::Resume {
                consumer_id,
                producer_id,
            } => coordinator
                .resume(client_id, consumer_id, producer_id)
                .await
                .unwrap_or_else(|e| vec![Err(e)]),
            ClientMessage::Pause {
                consumer_id,
                producer_id,
            } => coordinator
                .pause(client_id, consumer_id, producer_id)
                .await
                .unwrap_or_else(|e| vec![Err(e)]),
            ClientMessage::Close {
                consumer_id,
                producer_id,
                transport_id,
            } => coordinator
                .close(client_id, consumer_id, producer_id, transport_id)
                .await
                .into_iter()
                .map(Err)
                .collect(),
        }
    }

    async fn reply(&self, message_type: &'static str, reply: Result<ServerMessage, SfuError>) {
        let message = match reply {
            Ok(message) => message,
            Err(err) => {
                sfu_metrics::record_error(err.label(), err.error_code());
                match &err {
                    SfuError::EngineOperationFailed(_) | SfuError::Internal(_) => warn!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        client_id = ?self.client_id,
                        message_type = message_type,
                        error = %err,
                        "Request failed"
                    ),
                    _ => debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        client_id = ?self.client_id,
                        message_type = message_type,
                        error = %err,
                        "Request rejected"
                    ),
                }
                err.to_server_message()
            }
        };

        if self.outbound.send(message).await.is_err() {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                "Outbound queue closed, reply discarded"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, LocalEngineConfig};
    use crate::registry::SessionLimits;
    use std::time::Duration;

    fn spawn_actor() -> (
        Coordinator,
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<ServerMessage>,
    ) {
        let engine = Arc::new(LocalEngine::new(LocalEngineConfig::default()).unwrap());
        let coordinator = Coordinator::new(engine, SessionLimits::default());
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (handle, task) = ConnectionActor::spawn(
            coordinator.clone(),
            outbound_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (coordinator, handle, task, outbound_rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_before_join_is_rejected() {
        let (coordinator, handle, _task, mut rx) = spawn_actor();

        handle
            .deliver_frame(r#"{"type":"createTransport","payload":{"direction":"send"}}"#.into())
            .await
            .unwrap();

        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Error {
                error: "Not joined to a session".to_string(),
                code: 1
            }
        );
        assert_eq!(coordinator.stats().await.transports, 0);
    }

    #[tokio::test]
    async fn test_join_then_second_join_conflicts() {
        let (_coordinator, handle, _task, mut rx) = spawn_actor();
        let join = r#"{"type":"join","payload":{"sessionId":"S1","userId":"alice"}}"#;

        handle.deliver_frame(join.into()).await.unwrap();
        let client_id = match next(&mut rx).await {
            ServerMessage::RouterRtpCapabilities { client_id, .. } => client_id,
            other => unreachable!("unexpected reply {other:?}"),
        };

        handle.deliver_frame(join.into()).await.unwrap();
        assert!(matches!(
            next(&mut rx).await,
            ServerMessage::Error { code: 5, .. }
        ));

        let status = handle.status().await.unwrap();
        assert_eq!(status.client_id, Some(client_id));
        assert_eq!(status.frames_processed, 2);
        assert_eq!(handle.client_id(), Some(client_id));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let (_coordinator, handle, _task, mut rx) = spawn_actor();

        handle.deliver_frame("not json".into()).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Error {
                error: "Invalid message format".to_string(),
                code: 1
            }
        );

        handle
            .deliver_frame(r#"{"type":"restartIce","payload":{}}"#.into())
            .await
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Error {
                error: "Unknown message type: restartIce".to_string(),
                code: 1
            }
        );
    }

    #[tokio::test]
    async fn test_cancellation_disconnects_client() {
        let (coordinator, handle, task, mut rx) = spawn_actor();

        handle
            .deliver_frame(r#"{"type":"join","payload":{"sessionId":"S1","userId":"a"}}"#.into())
            .await
            .unwrap();
        next(&mut rx).await;
        assert_eq!(coordinator.stats().await.clients, 1);

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(coordinator.stats().await.clients, 0);
        assert_eq!(coordinator.stats().await.sessions, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (coordinator, handle, task, mut rx) = spawn_actor();

        handle
            .deliver_frame(r#"{"type":"join","payload":{"sessionId":"S1","userId":"a"}}"#.into())
            .await
            .unwrap();
        next(&mut rx).await;

        handle.disconnect().await;
        handle.disconnect().await;
        assert!(handle.is_cancelled());
        assert_eq!(coordinator.stats().await.clients, 0);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_actor() {
        let engine = Arc::new(LocalEngine::new(LocalEngineConfig::default()).unwrap());
        let coordinator = Coordinator::new(engine, SessionLimits::default());
        let parent = CancellationToken::new();
        let (outbound_tx, _outbound_rx) = mpsc::channel(4);

        let (handle, task) = ConnectionActor::spawn(
            coordinator,
            outbound_tx,
            parent.child_token(),
            ActorMetrics::new(),
        );

        parent.cancel();
        assert!(handle.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(handle.deliver_frame("{}".into()).await.is_err());
    }
}
