//! Actor model implementation.
//!
//! ```text
//! Coordinator (shared, lock-protected registry)
//! ├── N ConnectionActors (one per signaling connection, FIFO per connection)
//! └── EngineEventActor (singleton, drains media engine lifecycle events)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-connection ordering**: each connection's frames are handled by one task
//! - **CancellationToken propagation**: the server passes child tokens for graceful shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Connection: 50/200)
//!
//! # Modules
//!
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`engine_events`] - `EngineEventActor` feeding engine events into cleanup
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod engine_events;
pub mod messages;
pub mod metrics;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use engine_events::{EngineEventActor, EngineEventStats};
pub use messages::{ConnectionMessage, ConnectionStatus};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
