//! SFU Coordinator Library
//!
//! Signaling and entity-lifecycle coordinator for a selective forwarding unit:
//!
//! - WebSocket signaling with one actor per connection
//! - Session membership and per-client ownership of transports, producers and consumers
//! - Cascading teardown on close, disconnect and engine events
//! - Peer notifications (new producer, producer closed/paused/resumed, consumer closed)
//!
//! # Architecture
//!
//! ```text
//! server (axum WebSocket route)
//! └── ConnectionActor (one per connection, frames handled in order)
//!     └── Coordinator (shared)
//!         ├── EntityRegistry (sessions, clients, media entities)
//!         └── MediaEngine (transports, producers, consumers)
//! EngineEventActor ──> Coordinator cleanup path
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single registry lock**: registry mutations and their notifications happen
//!   under one lock, engine calls happen outside it
//! - **Identifier ownership**: every entity id is checked against the requesting client
//! - **Idempotent teardown**: close, disconnect and engine events share one removal path
//!
//! # Modules
//!
//! - [`actors`] - Connection and engine-event actors
//! - [`config`] - Service configuration from environment
//! - [`coordinator`] - Operation handlers
//! - [`engine`] - Media engine boundary and the in-process engine
//! - [`errors`] - Error types mapped to error replies
//! - [`fanout`] - Notification delivery
//! - [`observability`] - Health endpoints and metrics
//! - [`registry`] - Entity registry and cascade rules
//! - [`server`] - WebSocket signaling router

pub mod actors;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod fanout;
pub mod observability;
pub mod registry;
pub mod server;
