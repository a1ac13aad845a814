//! Entity registry.
//!
//! Canonical store of clients, sessions, transports, producers and consumers
//! and the references between them. Every operation completes as a single
//! step under the caller's lock, so no partially updated graph is ever
//! observable between two handler invocations.
//!
//! Removals never talk to the engine or to connections directly. They return
//! a [`Teardown`] describing the engine handles to close and the
//! notifications to deliver; the caller performs those effects after
//! releasing the lock.
//!
//! # Invariants
//!
//! - Ownership sets and entity maps agree in both directions.
//! - A producer's session is its owner's session.
//! - Consumers never outlive their producer, producers never outlive their
//!   transport, transports never outlive their client.
//! - A session exists exactly while it has members.

use crate::engine::EngineHandle;
use crate::errors::{EntityKind, SfuError};
use crate::fanout::{self, ConnectionHandle, Outbound};

use chrono::{DateTime, Utc};
use common::types::{ClientId, ConsumerId, ProducerId, SessionId, TransportId};
use serde_json::Value;
use signaling_protocol::{MediaKind, ProducerSummary, ServerMessage, TransportDirection};
use std::collections::{BTreeSet, HashMap};

/// Capacity limits enforced on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub max_participants_per_session: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: usize::MAX,
            max_participants_per_session: usize::MAX,
        }
    }
}

/// A joined client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub connection: ConnectionHandle,
    pub session_id: SessionId,
    pub user_id: String,
    pub user_info: Value,
    pub transports: BTreeSet<TransportId>,
    pub producers: BTreeSet<ProducerId>,
    pub consumers: BTreeSet<ConsumerId>,
}

/// A session (room).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub members: BTreeSet<ClientId>,
    pub producers: BTreeSet<ProducerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub owner: ClientId,
    pub direction: TransportDirection,
    pub producers: BTreeSet<ProducerId>,
    pub consumers: BTreeSet<ConsumerId>,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub owner: ClientId,
    pub session_id: SessionId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
    pub consumers: BTreeSet<ConsumerId>,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub owner: ClientId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Why a consumer is being removed. Decides whether its owner is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRemoval {
    /// The owner asked for it; no notification.
    Requested,
    /// The engine reported the consumer's producer gone; the owner is told.
    ProducerGone,
}

/// Effects of a removal, performed by the caller after unlocking.
#[derive(Debug, Default)]
pub struct Teardown {
    /// Engine handles to close, consumers first, transports last.
    pub closed: Vec<EngineHandle>,
    /// Notifications to deliver.
    pub notifications: Vec<Outbound>,
    /// Session destroyed because its last member left.
    pub removed_session: Option<SessionId>,
}

impl Teardown {
    /// Whether the removal touched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.notifications.is_empty() && self.removed_session.is_none()
    }
}

/// The entity registry.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    limits: SessionLimits,
    clients: HashMap<ClientId, ClientRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl EntityRegistry {
    /// Create an empty registry enforcing `limits` on join.
    #[must_use]
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    #[must_use]
    pub fn client(&self, id: &ClientId) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    #[must_use]
    pub fn transport(&self, id: &TransportId) -> Option<&TransportRecord> {
        self.transports.get(id)
    }

    #[must_use]
    pub fn producer(&self, id: &ProducerId) -> Option<&ProducerRecord> {
        self.producers.get(id)
    }

    #[must_use]
    pub fn consumer(&self, id: &ConsumerId) -> Option<&ConsumerRecord> {
        self.consumers.get(id)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Requester's client record.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Client)` if the client is gone.
    pub fn require_client(&self, id: &ClientId) -> Result<&ClientRecord, SfuError> {
        self.clients
            .get(id)
            .ok_or(SfuError::EntityNotFound(EntityKind::Client))
    }

    /// A transport owned by `owner`.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Transport)` or `NotOwner(Transport)`.
    pub fn owned_transport(
        &self,
        owner: &ClientId,
        id: &TransportId,
    ) -> Result<&TransportRecord, SfuError> {
        let transport = self
            .transports
            .get(id)
            .ok_or(SfuError::EntityNotFound(EntityKind::Transport))?;
        if transport.owner != *owner {
            return Err(SfuError::NotOwner(EntityKind::Transport));
        }
        Ok(transport)
    }

    /// A producer owned by `owner`.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Producer)` or `NotOwner(Producer)`.
    pub fn owned_producer(
        &self,
        owner: &ClientId,
        id: &ProducerId,
    ) -> Result<&ProducerRecord, SfuError> {
        let producer = self
            .producers
            .get(id)
            .ok_or(SfuError::EntityNotFound(EntityKind::Producer))?;
        if producer.owner != *owner {
            return Err(SfuError::NotOwner(EntityKind::Producer));
        }
        Ok(producer)
    }

    /// A consumer owned by `owner`.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Consumer)` or `NotOwner(Consumer)`.
    pub fn owned_consumer(
        &self,
        owner: &ClientId,
        id: &ConsumerId,
    ) -> Result<&ConsumerRecord, SfuError> {
        let consumer = self
            .consumers
            .get(id)
            .ok_or(SfuError::EntityNotFound(EntityKind::Consumer))?;
        if consumer.owner != *owner {
            return Err(SfuError::NotOwner(EntityKind::Consumer));
        }
        Ok(consumer)
    }

    /// Members of `session_id` other than `exclude`, with their connections.
    #[must_use]
    pub fn session_peers(
        &self,
        session_id: &SessionId,
        exclude: &ClientId,
    ) -> Vec<(ClientId, ConnectionHandle)> {
        let Some(session) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        session
            .members
            .iter()
            .filter(|member| *member != exclude)
            .filter_map(|member| {
                self.clients
                    .get(member)
                    .map(|client| (*member, client.connection.clone()))
            })
            .collect()
    }

    /// Producers currently published in a session.
    #[must_use]
    pub fn session_producers(&self, session_id: &SessionId) -> Vec<ProducerSummary> {
        let Some(session) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        session
            .producers
            .iter()
            .filter_map(|producer_id| {
                let producer = self.producers.get(producer_id)?;
                let owner = self.clients.get(&producer.owner)?;
                Some(ProducerSummary {
                    producer_id: *producer_id,
                    client_id: producer.owner,
                    user_id: owner.user_id.clone(),
                    kind: producer.kind,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    /// Register a client and add it to its session, creating the session if absent.
    ///
    /// # Errors
    ///
    /// `SessionFull` or `CapacityExceeded` when a limit would be crossed.
    pub fn insert_client(
        &mut self,
        client_id: ClientId,
        connection: ConnectionHandle,
        session_id: SessionId,
        user_id: String,
        user_info: Value,
    ) -> Result<(), SfuError> {
        if self.clients.contains_key(&client_id) {
            return Err(SfuError::Internal(format!("client id reused: {client_id}")));
        }

        match self.sessions.get(&session_id) {
            Some(session) if session.members.len() >= self.limits.max_participants_per_session => {
                return Err(SfuError::SessionFull);
            }
            None if self.sessions.len() >= self.limits.max_sessions => {
                return Err(SfuError::CapacityExceeded);
            }
            _ => {}
        }

        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionRecord {
                members: BTreeSet::new(),
                producers: BTreeSet::new(),
                created_at: Utc::now(),
            })
            .members
            .insert(client_id);

        self.clients.insert(
            client_id,
            ClientRecord {
                connection,
                session_id,
                user_id,
                user_info,
                transports: BTreeSet::new(),
                producers: BTreeSet::new(),
                consumers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Register a transport under its owner.
    ///
    /// # Errors
    ///
    /// `EntityNotFound(Client)` if the owner is gone.
    pub fn insert_transport(
        &mut self,
        transport_id: TransportId,
        owner: ClientId,
        direction: TransportDirection,
    ) -> Result<(), SfuError> {
        let client = self
            .clients
            .get_mut(&owner)
            .ok_or(SfuError::EntityNotFound(EntityKind::Client))?;
        client.transports.insert(transport_id);

        self.transports.insert(
            transport_id,
            TransportRecord {
                owner,
                direction,
                producers: BTreeSet::new(),
                consumers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Register a producer under its owner, transport and the owner's session.
    ///
    /// Returns the session the producer was published in.
    ///
    /// # Errors
    ///
    /// Not-found or ownership errors if the owner or transport vanished, and
    /// `WrongDirection` for a receive transport.
    pub fn insert_producer(
        &mut self,
        producer_id: ProducerId,
        owner: ClientId,
        transport_id: TransportId,
        kind: MediaKind,
    ) -> Result<SessionId, SfuError> {
        let session_id = self.require_client(&owner)?.session_id.clone();
        if self.owned_transport(&owner, &transport_id)?.direction != TransportDirection::Send {
            return Err(SfuError::WrongDirection);
        }
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| SfuError::Internal(format!("session {session_id} missing")))?;
        session.producers.insert(producer_id);

        if let Some(client) = self.clients.get_mut(&owner) {
            client.producers.insert(producer_id);
        }
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.producers.insert(producer_id);
        }
        self.producers.insert(
            producer_id,
            ProducerRecord {
                owner,
                session_id: session_id.clone(),
                transport_id,
                kind,
                paused: false,
                consumers: BTreeSet::new(),
            },
        );
        Ok(session_id)
    }

    /// Register a consumer under its owner, transport and producer.
    ///
    /// # Errors
    ///
    /// Not-found or ownership errors if anything referenced vanished, and
    /// `WrongDirection` for a send transport.
    pub fn insert_consumer(
        &mut self,
        consumer_id: ConsumerId,
        owner: ClientId,
        transport_id: TransportId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), SfuError> {
        self.require_client(&owner)?;
        if self.owned_transport(&owner, &transport_id)?.direction != TransportDirection::Recv {
            return Err(SfuError::WrongDirection);
        }
        let producer = self
            .producers
            .get_mut(&producer_id)
            .ok_or(SfuError::EntityNotFound(EntityKind::Producer))?;
        producer.consumers.insert(consumer_id);

        if let Some(client) = self.clients.get_mut(&owner) {
            client.consumers.insert(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.consumers.insert(consumer_id);
        }
        self.consumers.insert(
            consumer_id,
            ConsumerRecord {
                owner,
                producer_id,
                transport_id,
                kind,
                paused: true,
            },
        );
        Ok(())
    }

    /// Record the producer's paused state. Returns `false` if it is gone.
    pub fn set_producer_paused(&mut self, id: &ProducerId, paused: bool) -> bool {
        match self.producers.get_mut(id) {
            Some(producer) => {
                producer.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Record the consumer's paused state. Returns `false` if it is gone.
    pub fn set_consumer_paused(&mut self, id: &ConsumerId, paused: bool) -> bool {
        match self.consumers.get_mut(id) {
            Some(consumer) => {
                consumer.paused = paused;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Removals
    // ------------------------------------------------------------------

    /// Remove a consumer. Absent ids are a no-op.
    pub fn remove_consumer(&mut self, id: &ConsumerId, removal: ConsumerRemoval) -> Teardown {
        let mut teardown = Teardown::default();
        self.detach_consumer(id, removal == ConsumerRemoval::ProducerGone, &mut teardown);
        teardown
    }

    /// Remove a producer and every consumer reading from it. Absent ids are a no-op.
    pub fn remove_producer(&mut self, id: &ProducerId) -> Teardown {
        let mut teardown = Teardown::default();
        self.detach_producer(id, &mut teardown);
        teardown
    }

    /// Remove a transport with everything built on it. Absent ids are a no-op.
    pub fn remove_transport(&mut self, id: &TransportId) -> Teardown {
        let mut teardown = Teardown::default();
        self.detach_transport(id, &mut teardown);
        teardown
    }

    /// Remove a client with everything it owns, leave its session and
    /// destroy the session if it became empty. Absent ids are a no-op, so
    /// duplicate disconnect signals are harmless.
    ///
    /// The departing client is never addressed by the returned notifications.
    pub fn remove_client(&mut self, id: &ClientId) -> Teardown {
        let mut teardown = Teardown::default();
        let Some(client) = self.clients.get(id) else {
            return teardown;
        };
        let transports = client.transports.clone();

        for transport_id in &transports {
            self.detach_transport(transport_id, &mut teardown);
        }

        // Anything not hanging off a transport is walked explicitly.
        if let Some(client) = self.clients.get(id) {
            let producers = client.producers.clone();
            let consumers = client.consumers.clone();
            for producer_id in &producers {
                self.detach_producer(producer_id, &mut teardown);
            }
            for consumer_id in &consumers {
                self.detach_consumer(consumer_id, false, &mut teardown);
            }
        }

        if let Some(client) = self.clients.remove(id) {
            let now_empty = match self.sessions.get_mut(&client.session_id) {
                Some(session) => {
                    session.members.remove(id);
                    session.members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.sessions.remove(&client.session_id);
                teardown.removed_session = Some(client.session_id);
            }
        }

        teardown
            .notifications
            .retain(|outbound| outbound.recipient != *id);
        teardown
    }

    fn detach_consumer(&mut self, id: &ConsumerId, notify_owner: bool, teardown: &mut Teardown) {
        let Some(consumer) = self.consumers.remove(id) else {
            return;
        };

        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(id);
        }
        if let Some(owner) = self.clients.get_mut(&consumer.owner) {
            owner.consumers.remove(id);
            if notify_owner {
                teardown.notifications.push(Outbound {
                    recipient: consumer.owner,
                    connection: owner.connection.clone(),
                    message: ServerMessage::ConsumerClosed {
                        consumer_id: *id,
                        producer_id: consumer.producer_id,
                    },
                });
            }
        }

        teardown.closed.push(EngineHandle::Consumer(*id));
    }

    fn detach_producer(&mut self, id: &ProducerId, teardown: &mut Teardown) {
        let Some(consumers) = self.producers.get(id).map(|p| p.consumers.clone()) else {
            return;
        };
        for consumer_id in &consumers {
            self.detach_consumer(consumer_id, true, teardown);
        }

        let Some(producer) = self.producers.remove(id) else {
            return;
        };

        // Peers are addressed while the session still lists the producer.
        let closed = ServerMessage::ProducerClosed {
            producer_id: *id,
            client_id: producer.owner,
        };
        teardown.notifications.extend(fanout::to_peers(
            self.session_peers(&producer.session_id, &producer.owner),
            &closed,
        ));

        if let Some(session) = self.sessions.get_mut(&producer.session_id) {
            session.producers.remove(id);
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(id);
        }
        if let Some(owner) = self.clients.get_mut(&producer.owner) {
            owner.producers.remove(id);
        }

        teardown.closed.push(EngineHandle::Producer(*id));
    }

    fn detach_transport(&mut self, id: &TransportId, teardown: &mut Teardown) {
        let Some(transport) = self.transports.get(id) else {
            return;
        };
        let consumers = transport.consumers.clone();
        let producers = transport.producers.clone();

        for consumer_id in &consumers {
            self.detach_consumer(consumer_id, false, teardown);
        }
        for producer_id in &producers {
            self.detach_producer(producer_id, teardown);
        }

        if let Some(transport) = self.transports.remove(id) {
            if let Some(owner) = self.clients.get_mut(&transport.owner) {
                owner.transports.remove(id);
            }
        }

        teardown.closed.push(EngineHandle::Transport(*id));
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Check every cross-reference in the registry.
    ///
    /// # Errors
    ///
    /// Describes the first violated invariant.
    pub fn verify_integrity(&self) -> Result<(), String> {
        for (client_id, client) in &self.clients {
            let session = self
                .sessions
                .get(&client.session_id)
                .ok_or_else(|| format!("client {client_id} in missing session"))?;
            ensure(session.members.contains(client_id), || {
                format!("session {} does not list client {client_id}", client.session_id)
            })?;

            for transport_id in &client.transports {
                let transport = self
                    .transports
                    .get(transport_id)
                    .ok_or_else(|| format!("client {client_id} owns missing transport"))?;
                ensure(transport.owner == *client_id, || {
                    format!("transport {transport_id} owner mismatch")
                })?;
            }
            for producer_id in &client.producers {
                let producer = self
                    .producers
                    .get(producer_id)
                    .ok_or_else(|| format!("client {client_id} owns missing producer"))?;
                ensure(producer.owner == *client_id, || {
                    format!("producer {producer_id} owner mismatch")
                })?;
            }
            for consumer_id in &client.consumers {
                let consumer = self
                    .consumers
                    .get(consumer_id)
                    .ok_or_else(|| format!("client {client_id} owns missing consumer"))?;
                ensure(consumer.owner == *client_id, || {
                    format!("consumer {consumer_id} owner mismatch")
                })?;
            }
        }

        for (session_id, session) in &self.sessions {
            ensure(!session.members.is_empty(), || {
                format!("session {session_id} has no members")
            })?;
            for member in &session.members {
                let client = self
                    .clients
                    .get(member)
                    .ok_or_else(|| format!("session {session_id} lists missing client"))?;
                ensure(client.session_id == *session_id, || {
                    format!("client {member} session mismatch")
                })?;
            }
            for producer_id in &session.producers {
                let producer = self
                    .producers
                    .get(producer_id)
                    .ok_or_else(|| format!("session {session_id} lists missing producer"))?;
                ensure(producer.session_id == *session_id, || {
                    format!("producer {producer_id} session mismatch")
                })?;
            }
        }

        for (transport_id, transport) in &self.transports {
            let owner = self
                .clients
                .get(&transport.owner)
                .ok_or_else(|| format!("transport {transport_id} outlived its client"))?;
            ensure(owner.transports.contains(transport_id), || {
                format!("transport {transport_id} missing from owner")
            })?;
            for producer_id in &transport.producers {
                ensure(
                    self.producers
                        .get(producer_id)
                        .is_some_and(|p| p.transport_id == *transport_id),
                    || format!("transport {transport_id} lists stray producer"),
                )?;
            }
            for consumer_id in &transport.consumers {
                ensure(
                    self.consumers
                        .get(consumer_id)
                        .is_some_and(|c| c.transport_id == *transport_id),
                    || format!("transport {transport_id} lists stray consumer"),
                )?;
            }
        }

        for (producer_id, producer) in &self.producers {
            let owner = self
                .clients
                .get(&producer.owner)
                .ok_or_else(|| format!("producer {producer_id} outlived its client"))?;
            ensure(owner.producers.contains(producer_id), || {
                format!("producer {producer_id} missing from owner")
            })?;
            ensure(owner.session_id == producer.session_id, || {
                format!("producer {producer_id} session differs from owner")
            })?;
            ensure(
                self.transports
                    .get(&producer.transport_id)
                    .is_some_and(|t| t.producers.contains(producer_id)),
                || format!("producer {producer_id} outlived its transport"),
            )?;
            ensure(
                self.sessions
                    .get(&producer.session_id)
                    .is_some_and(|s| s.producers.contains(producer_id)),
                || format!("producer {producer_id} missing from session"),
            )?;
            for consumer_id in &producer.consumers {
                ensure(
                    self.consumers
                        .get(consumer_id)
                        .is_some_and(|c| c.producer_id == *producer_id),
                    || format!("producer {producer_id} lists stray consumer"),
                )?;
            }
        }

        for (consumer_id, consumer) in &self.consumers {
            ensure(
                self.clients
                    .get(&consumer.owner)
                    .is_some_and(|c| c.consumers.contains(consumer_id)),
                || format!("consumer {consumer_id} outlived its client"),
            )?;
            ensure(
                self.transports
                    .get(&consumer.transport_id)
                    .is_some_and(|t| t.consumers.contains(consumer_id)),
                || format!("consumer {consumer_id} outlived its transport"),
            )?;
            ensure(
                self.producers
                    .get(&consumer.producer_id)
                    .is_some_and(|p| p.consumers.contains(consumer_id)),
                || format!("consumer {consumer_id} outlived its producer"),
            )?;
        }

        Ok(())
    }
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}
