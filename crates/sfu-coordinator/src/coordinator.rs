//! Lifecycle coordinator.
//!
//! Implements every signaling operation against the shared [`EntityRegistry`]
//! and the [`MediaEngine`]. The registry lock is only held to validate and to
//! record results; engine calls happen without it. After an engine call the
//! lock is retaken and the preconditions re-checked, so a client that
//! disconnected mid-call never ends up with a registered handle: the fresh
//! handle is closed and the requester gets a not-found error.
//!
//! Explicit close, disconnect and engine lifecycle events all funnel into the
//! same registry removals, which return a [`Teardown`] applied here after the
//! lock is released.

use crate::engine::{EngineEvent, EngineHandle, MediaEngine};
use crate::errors::{EntityKind, SfuError};
use crate::fanout::{self, ConnectionHandle};
use crate::observability::metrics as sfu_metrics;
use crate::registry::{ConsumerRemoval, EntityRegistry, SessionLimits, Teardown};

use chrono::Utc;
use common::types::{ClientId, ConsumerId, ProducerId, SessionId, TransportId};
use serde_json::Value;
use signaling_protocol::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, ServerMessage, TransportDirection,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Replies for a request that touches several entities independently.
pub type Replies = Vec<Result<ServerMessage, SfuError>>;

/// Registry population at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub clients: usize,
    pub sessions: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct Inner {
    registry: Mutex<EntityRegistry>,
    engine: Arc<dyn MediaEngine>,
    draining: AtomicBool,
}

/// Shared handle to the lifecycle coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator driving `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, limits: SessionLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(EntityRegistry::new(limits)),
                engine,
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Stop accepting joins. Existing clients keep working.
    pub fn begin_drain(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            info!(target: "sfu.coordinator", "Coordinator draining, new joins rejected");
        }
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Run `f` against the registry under the lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&EntityRegistry) -> R) -> R {
        let registry = self.inner.registry.lock().await;
        f(&registry)
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.inspect(|registry| CoordinatorStats {
            clients: registry.client_count(),
            sessions: registry.session_count(),
            transports: registry.transport_count(),
            producers: registry.producer_count(),
            consumers: registry.consumer_count(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    /// Register a new client in `session_id`, creating the session if absent.
    ///
    /// Returns the new client id and the `routerRtpCapabilities` reply.
    ///
    /// # Errors
    ///
    /// `Draining`, `SessionFull` or `CapacityExceeded`.
    #[instrument(skip_all, name = "sfu.coordinator.join", fields(session_id = %session_id))]
    pub async fn join(
        &self,
        connection: ConnectionHandle,
        session_id: SessionId,
        user_id: String,
        user_info: Value,
    ) -> Result<(ClientId, ServerMessage), SfuError> {
        if self.is_draining() {
            return Err(SfuError::Draining);
        }

        let client_id = ClientId::new();
        let mut registry = self.inner.registry.lock().await;
        registry.insert_client(
            client_id,
            connection,
            session_id.clone(),
            user_id.clone(),
            user_info,
        )?;

        let producers = registry.session_producers(&session_id);
        let (members, session_age_secs) = registry
            .session(&session_id)
            .map(|s| (s.members.len(), (Utc::now() - s.created_at).num_seconds()))
            .unwrap_or_default();
        publish_population(&registry);
        drop(registry);

        info!(
            target: "sfu.coordinator",
            client_id = %client_id,
            session_id = %session_id,
            user_id = %user_id,
            members = members,
            session_age_secs = session_age_secs,
            existing_producers = producers.len(),
            "Client joined session"
        );

        Ok((
            client_id,
            ServerMessage::RouterRtpCapabilities {
                client_id,
                rtp_capabilities: self.inner.engine.rtp_capabilities(),
                producers,
            },
        ))
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    /// Create a transport for `client_id`.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Client)` or `EngineOperationFailed`.
    pub async fn create_transport(
        &self,
        client_id: ClientId,
        direction: TransportDirection,
    ) -> Result<ServerMessage, SfuError> {
        self.inner
            .registry
            .lock()
            .await
            .require_client(&client_id)?;

        let transport = self.inner.engine.create_transport(direction).await?;

        let registered = self
            .inner
            .registry
            .lock()
            .await
            .insert_transport(transport.id, client_id, direction);
        if let Err(err) = registered {
            self.discard(EngineHandle::Transport(transport.id), &client_id)
                .await;
            return Err(err);
        }

        info!(
            target: "sfu.coordinator",
            client_id = %client_id,
            transport_id = %transport.id,
            direction = %direction,
            "Transport created"
        );

        Ok(ServerMessage::TransportCreated {
            transport_id: transport.id,
            direction,
            ice_parameters: transport.ice_parameters,
            ice_candidates: transport.ice_candidates,
            dtls_parameters: transport.dtls_parameters,
            sctp_parameters: transport.sctp_parameters,
        })
    }

    /// Apply the client's DTLS parameters to one of its transports.
    ///
    /// # Errors
    ///
    /// Not-found, `NotOwner(Transport)` or `EngineOperationFailed`.
    pub async fn connect_transport(
        &self,
        client_id: ClientId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<ServerMessage, SfuError> {
        {
            let registry = self.inner.registry.lock().await;
            registry.require_client(&client_id)?;
            registry.owned_transport(&client_id, &transport_id)?;
        }

        self.inner
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;

        debug!(
            target: "sfu.coordinator",
            client_id = %client_id,
            transport_id = %transport_id,
            "Transport connected"
        );

        Ok(ServerMessage::TransportConnected { transport_id })
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    /// Publish a stream on a send transport and tell the other session members.
    ///
    /// # Errors
    ///
    /// Not-found, `NotOwner(Transport)`, `WrongDirection` or
    /// `EngineOperationFailed`.
    #[instrument(skip_all, name = "sfu.coordinator.produce", fields(client_id = %client_id))]
    pub async fn produce(
        &self,
        client_id: ClientId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ServerMessage, SfuError> {
        {
            let registry = self.inner.registry.lock().await;
            registry.require_client(&client_id)?;
            if registry.owned_transport(&client_id, &transport_id)?.direction
                != TransportDirection::Send
            {
                return Err(SfuError::WrongDirection);
            }
        }

        let producer_id = self
            .inner
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        let announce = {
            let mut registry = self.inner.registry.lock().await;
            match registry.insert_producer(producer_id, client_id, transport_id, kind) {
                Ok(session_id) => {
                    let user_id = registry
                        .client(&client_id)
                        .map(|c| c.user_id.clone())
                        .unwrap_or_default();
                    let message = ServerMessage::NewProducer {
                        producer_id,
                        client_id,
                        user_id,
                        kind,
                    };
                    Ok((
                        session_id.clone(),
                        fanout::to_peers(registry.session_peers(&session_id, &client_id), &message),
                    ))
                }
                Err(err) => Err(err),
            }
        };

        let (session_id, notifications) = match announce {
            Ok(announce) => announce,
            Err(err) => {
                self.discard(EngineHandle::Producer(producer_id), &client_id)
                    .await;
                return Err(err);
            }
        };

        info!(
            target: "sfu.coordinator",
            client_id = %client_id,
            session_id = %session_id,
            producer_id = %producer_id,
            kind = %kind,
            peers = notifications.len(),
            "Producer created"
        );
        fanout::deliver(notifications);

        Ok(ServerMessage::Produced { producer_id, kind })
    }

    /// Subscribe the client to a producer over one of its receive transports.
    /// The consumer starts paused.
    ///
    /// # Errors
    ///
    /// Not-found, `NotOwner(Transport)`, `WrongDirection`,
    /// `CapabilityMismatch` or `EngineOperationFailed`.
    #[instrument(skip_all, name = "sfu.coordinator.consume", fields(client_id = %client_id))]
    pub async fn consume(
        &self,
        client_id: ClientId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ServerMessage, SfuError> {
        {
            let registry = self.inner.registry.lock().await;
            registry.require_client(&client_id)?;
            if registry.owned_transport(&client_id, &transport_id)?.direction
                != TransportDirection::Recv
            {
                return Err(SfuError::WrongDirection);
            }
            if registry.producer(&producer_id).is_none() {
                return Err(SfuError::EntityNotFound(EntityKind::Producer));
            }
        }

        if !self
            .inner
            .engine
            .can_consume(producer_id, &rtp_capabilities)
            .await
        {
            debug!(
                target: "sfu.coordinator",
                client_id = %client_id,
                producer_id = %producer_id,
                "Remote capabilities cannot consume producer"
            );
            return Err(SfuError::CapabilityMismatch);
        }

        let consumer = self
            .inner
            .engine
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;

        let registered = self.inner.registry.lock().await.insert_consumer(
            consumer.id,
            client_id,
            transport_id,
            producer_id,
            consumer.kind,
        );
        if let Err(err) = registered {
            self.discard(EngineHandle::Consumer(consumer.id), &client_id)
                .await;
            return Err(err);
        }

        info!(
            target: "sfu.coordinator",
            client_id = %client_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            kind = %consumer.kind,
            "Consumer created"
        );

        Ok(ServerMessage::Consumed {
            consumer_id: consumer.id,
            producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            paused: consumer.paused,
        })
    }

    /// Resume a consumer and/or a producer. Each id is handled independently.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if neither id is given.
    pub async fn resume(
        &self,
        client_id: ClientId,
        consumer_id: Option<ConsumerId>,
        producer_id: Option<ProducerId>,
    ) -> Result<Replies, SfuError> {
        self.set_paused(client_id, consumer_id, producer_id, false)
            .await
    }

    /// Pause a consumer and/or a producer. Each id is handled independently.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` if neither id is given.
    pub async fn pause(
        &self,
        client_id: ClientId,
        consumer_id: Option<ConsumerId>,
        producer_id: Option<ProducerId>,
    ) -> Result<Replies, SfuError> {
        self.set_paused(client_id, consumer_id, producer_id, true)
            .await
    }

    async fn set_paused(
        &self,
        client_id: ClientId,
        consumer_id: Option<ConsumerId>,
        producer_id: Option<ProducerId>,
        paused: bool,
    ) -> Result<Replies, SfuError> {
        if consumer_id.is_none() && producer_id.is_none() {
            return Err(SfuError::MalformedMessage(
                "neither consumerId nor producerId given".to_string(),
            ));
        }

        let mut replies = Vec::with_capacity(2);
        if let Some(consumer_id) = consumer_id {
            replies.push(
                self.set_consumer_paused(client_id, consumer_id, paused)
                    .await,
            );
        }
        if let Some(producer_id) = producer_id {
            replies.push(
                self.set_producer_paused(client_id, producer_id, paused)
                    .await,
            );
        }
        Ok(replies)
    }

    async fn set_consumer_paused(
        &self,
        client_id: ClientId,
        consumer_id: ConsumerId,
        paused: bool,
    ) -> Result<ServerMessage, SfuError> {
        {
            let registry = self.inner.registry.lock().await;
            registry.require_client(&client_id)?;
            registry.owned_consumer(&client_id, &consumer_id)?;
        }

        let handle = EngineHandle::Consumer(consumer_id);
        if paused {
            self.inner.engine.pause(handle).await?;
        } else {
            self.inner.engine.resume(handle).await?;
        }

        if !self
            .inner
            .registry
            .lock()
            .await
            .set_consumer_paused(&consumer_id, paused)
        {
            return Err(SfuError::EntityNotFound(EntityKind::Consumer));
        }

        debug!(
            target: "sfu.coordinator",
            client_id = %client_id,
            consumer_id = %consumer_id,
            paused = paused,
            "Consumer state changed"
        );

        let ids = (Some(consumer_id), None);
        Ok(paused_reply(paused, ids))
    }

    async fn set_producer_paused(
        &self,
        client_id: ClientId,
        producer_id: ProducerId,
        paused: bool,
    ) -> Result<ServerMessage, SfuError> {
        {
            let registry = self.inner.registry.lock().await;
            registry.require_client(&client_id)?;
            registry.owned_producer(&client_id, &producer_id)?;
        }

        let handle = EngineHandle::Producer(producer_id);
        if paused {
            self.inner.engine.pause(handle).await?;
        } else {
            self.inner.engine.resume(handle).await?;
        }

        let notifications = {
            let mut registry = self.inner.registry.lock().await;
            if !registry.set_producer_paused(&producer_id, paused) {
                return Err(SfuError::EntityNotFound(EntityKind::Producer));
            }
            let session_id = registry
                .producer(&producer_id)
                .map(|p| p.session_id.clone())
                .ok_or(SfuError::EntityNotFound(EntityKind::Producer))?;
            let message = if paused {
                ServerMessage::ProducerPaused {
                    producer_id,
                    client_id,
                }
            } else {
                ServerMessage::ProducerResumed {
                    producer_id,
                    client_id,
                }
            };
            fanout::to_peers(registry.session_peers(&session_id, &client_id), &message)
        };

        debug!(
            target: "sfu.coordinator",
            client_id = %client_id,
            producer_id = %producer_id,
            paused = paused,
            peers = notifications.len(),
            "Producer state changed"
        );
        fanout::deliver(notifications);

        Ok(paused_reply(paused, (None, Some(producer_id))))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close any combination of a consumer, a producer and a transport owned
    /// by the client. Ids that are no longer registered are ignored.
    ///
    /// Returns one error per id that could not be closed.
    pub async fn close(
        &self,
        client_id: ClientId,
        consumer_id: Option<ConsumerId>,
        producer_id: Option<ProducerId>,
        transport_id: Option<TransportId>,
    ) -> Vec<SfuError> {
        let mut errors = Vec::new();

        if let Some(consumer_id) = consumer_id {
            let removed = {
                let mut registry = self.inner.registry.lock().await;
                match registry.owned_consumer(&client_id, &consumer_id) {
                    Ok(_) => Ok(registry.remove_consumer(&consumer_id, ConsumerRemoval::Requested)),
                    Err(err) => Err(err),
                }
            };
            self.finish_close(removed, &mut errors).await;
        }

        if let Some(producer_id) = producer_id {
            let removed = {
                let mut registry = self.inner.registry.lock().await;
                match registry.owned_producer(&client_id, &producer_id) {
                    Ok(_) => Ok(registry.remove_producer(&producer_id)),
                    Err(err) => Err(err),
                }
            };
            self.finish_close(removed, &mut errors).await;
        }

        if let Some(transport_id) = transport_id {
            let removed = {
                let mut registry = self.inner.registry.lock().await;
                match registry.owned_transport(&client_id, &transport_id) {
                    Ok(_) => Ok(registry.remove_transport(&transport_id)),
                    Err(err) => Err(err),
                }
            };
            self.finish_close(removed, &mut errors).await;
        }

        if errors.is_empty() {
            debug!(
                target: "sfu.coordinator",
                client_id = %client_id,
                "Close request applied"
            );
        }
        errors
    }

    async fn finish_close(&self, removed: Result<Teardown, SfuError>, errors: &mut Vec<SfuError>) {
        match removed {
            Ok(teardown) => self.apply(teardown).await,
            // Already gone, e.g. removed by an engine event first.
            Err(SfuError::EntityNotFound(_)) => {}
            Err(err) => errors.push(err),
        }
    }

    /// Remove a client and everything it owns. Safe to call repeatedly and
    /// concurrently with any in-flight request of the same client.
    ///
    /// Returns `false` if the client was already gone.
    #[instrument(skip_all, name = "sfu.coordinator.disconnect", fields(client_id = %client_id))]
    pub async fn disconnect(&self, client_id: ClientId) -> bool {
        let (session_id, teardown) = {
            let mut registry = self.inner.registry.lock().await;
            let session_id = registry.client(&client_id).map(|c| c.session_id.clone());
            let teardown = registry.remove_client(&client_id);
            publish_population(&registry);
            (session_id, teardown)
        };

        let Some(session_id) = session_id else {
            return false;
        };

        info!(
            target: "sfu.coordinator",
            client_id = %client_id,
            session_id = %session_id,
            closed_handles = teardown.closed.len(),
            notifications = teardown.notifications.len(),
            session_removed = teardown.removed_session.is_some(),
            "Client disconnected"
        );
        if let Some(removed) = &teardown.removed_session {
            info!(target: "sfu.coordinator", session_id = %removed, "Session closed");
        }

        self.apply(teardown).await;
        true
    }

    /// Feed an engine lifecycle event into the cleanup path.
    ///
    /// Returns `true` if registry state changed. Events for ids that are no
    /// longer registered are ignored. `WorkerDied` is not handled here.
    pub async fn handle_engine_event(&self, event: EngineEvent) -> bool {
        let teardown = {
            let mut registry = self.inner.registry.lock().await;
            let teardown = match &event {
                EngineEvent::TransportClosed { transport_id } => {
                    registry.remove_transport(transport_id)
                }
                EngineEvent::ProducerClosed { producer_id } => registry.remove_producer(producer_id),
                EngineEvent::ConsumerProducerClosed { consumer_id } => {
                    registry.remove_consumer(consumer_id, ConsumerRemoval::ProducerGone)
                }
                EngineEvent::WorkerDied { .. } => Teardown::default(),
            };
            publish_population(&registry);
            teardown
        };

        if teardown.is_empty() {
            debug!(
                target: "sfu.coordinator",
                event = event.label(),
                "Engine event for unregistered entity ignored"
            );
            return false;
        }

        info!(
            target: "sfu.coordinator",
            event = event.label(),
            closed_handles = teardown.closed.len(),
            notifications = teardown.notifications.len(),
            "Engine event applied"
        );
        self.apply(teardown).await;
        true
    }

    async fn apply(&self, teardown: Teardown) {
        fanout::deliver(teardown.notifications);
        for handle in teardown.closed {
            self.inner.engine.close(handle).await;
        }
    }

    async fn discard(&self, handle: EngineHandle, client_id: &ClientId) {
        warn!(
            target: "sfu.coordinator",
            client_id = %client_id,
            handle = %handle,
            "Owner vanished during engine call, closing new handle"
        );
        self.inner.engine.close(handle).await;
    }
}

fn paused_reply(paused: bool, ids: (Option<ConsumerId>, Option<ProducerId>)) -> ServerMessage {
    let (consumer_id, producer_id) = ids;
    if paused {
        ServerMessage::Paused {
            consumer_id,
            producer_id,
        }
    } else {
        ServerMessage::Resumed {
            consumer_id,
            producer_id,
        }
    }
}

fn publish_population(registry: &EntityRegistry) {
    sfu_metrics::set_clients_active(registry.client_count());
    sfu_metrics::set_sessions_active(registry.session_count());
}
