//! Notification fan-out.
//!
//! Peers are reached through [`ConnectionHandle`]s, weak references to each
//! connection's outbound queue. Delivery is best effort: a full or closed
//! queue drops that one message and delivery to the others continues.

use crate::observability::metrics as sfu_metrics;

use common::types::ClientId;
use signaling_protocol::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Weak back-reference to a connection's outbound queue.
///
/// Holding a handle never keeps a connection alive.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::WeakSender<ServerMessage>,
}

impl ConnectionHandle {
    /// Create a handle that does not keep `sender` alive.
    #[must_use]
    pub fn new(sender: &mpsc::Sender<ServerMessage>) -> Self {
        Self {
            sender: sender.downgrade(),
        }
    }

    /// Queue a message without waiting. Returns `false` if the connection is
    /// gone or its queue is full.
    pub fn try_deliver(&self, message: ServerMessage) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.upgrade().is_some()
    }
}

/// A message addressed to one client.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub recipient: ClientId,
    pub connection: ConnectionHandle,
    pub message: ServerMessage,
}

/// Address `message` to every peer in `peers`.
pub fn to_peers(
    peers: impl IntoIterator<Item = (ClientId, ConnectionHandle)>,
    message: &ServerMessage,
) -> Vec<Outbound> {
    peers
        .into_iter()
        .map(|(recipient, connection)| Outbound {
            recipient,
            connection,
            message: message.clone(),
        })
        .collect()
}

/// Outcome of a delivery round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Deliver notifications independently. Must be called without the registry lock.
pub fn deliver(notifications: Vec<Outbound>) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for outbound in notifications {
        let message_type = outbound.message.message_type();
        if outbound.connection.try_deliver(outbound.message) {
            report.delivered += 1;
            debug!(
                target: "sfu.fanout",
                client_id = %outbound.recipient,
                message_type = message_type,
                "Notification queued"
            );
        } else {
            report.dropped += 1;
            sfu_metrics::record_notification_dropped();
            warn!(
                target: "sfu.fanout",
                client_id = %outbound.recipient,
                message_type = message_type,
                "Notification dropped"
            );
        }
    }

    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::ProducerId;

    fn closed_message() -> ServerMessage {
        ServerMessage::ProducerClosed {
            producer_id: ProducerId::new(),
            client_id: ClientId::new(),
        }
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_connection_alive() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(&tx);

        assert!(handle.is_open());
        assert!(handle.try_deliver(closed_message()));
        assert!(rx.recv().await.is_some());

        drop(tx);
        assert!(!handle.is_open());
        assert!(!handle.try_deliver(closed_message()));
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = mpsc::channel(4);
        let (ok_tx, mut ok_rx) = mpsc::channel(4);

        let full = ConnectionHandle::new(&full_tx);
        assert!(full.try_deliver(closed_message()));
        let gone = ConnectionHandle::new(&gone_tx);
        drop(gone_rx);
        let ok = ConnectionHandle::new(&ok_tx);

        let message = closed_message();
        let notifications = to_peers(
            [
                (ClientId::new(), full),
                (ClientId::new(), gone),
                (ClientId::new(), ok),
            ],
            &message,
        );

        let report = deliver(notifications);
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                dropped: 2
            }
        );
        assert_eq!(ok_rx.recv().await.unwrap(), message);
    }
}
