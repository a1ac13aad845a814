//! Message types for actor communication.
//!
//! Request-reply uses `tokio::sync::oneshot`.

use common::types::ClientId;
use tokio::sync::oneshot;

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A text frame received from the client.
    Frame { text: String },

    /// Report the connection's state.
    GetStatus {
        respond_to: oneshot::Sender<ConnectionStatus>,
    },
}

/// Snapshot of a connection actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Set once `join` succeeded.
    pub client_id: Option<ClientId>,
    /// Frames handled so far.
    pub frames_processed: u64,
}
