//! `EngineEventActor` - drains the media engine's lifecycle events.
//!
//! Every event is posted into the coordinator's cleanup path, the same
//! registry removals used by explicit close and disconnect. A dead engine
//! worker is fatal: the actor cancels the process-wide fatal token and stops.

use crate::coordinator::Coordinator;
use crate::engine::EngineEvent;
use crate::observability::metrics as sfu_metrics;

use super::metrics::{ActorType, MailboxMonitor};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// What the actor saw over its lifetime, returned when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineEventStats {
    pub events_processed: u64,
    /// Largest number of events left queued behind one being handled.
    pub peak_backlog: usize,
}

/// The `EngineEventActor` implementation.
pub struct EngineEventActor {
    coordinator: Coordinator,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel_token: CancellationToken,
    fatal_token: CancellationToken,
    mailbox: MailboxMonitor,
}

impl EngineEventActor {
    /// Spawn the actor.
    ///
    /// `fatal_token` is cancelled if the engine worker dies.
    pub fn spawn(
        coordinator: Coordinator,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        cancel_token: CancellationToken,
        fatal_token: CancellationToken,
    ) -> JoinHandle<EngineEventStats> {
        let actor = Self {
            coordinator,
            events,
            cancel_token,
            fatal_token,
            mailbox: MailboxMonitor::new(ActorType::EngineEvents, "engine"),
        };
        tokio::spawn(actor.run())
    }

    #[instrument(skip_all, name = "sfu.actor.engine_events")]
    async fn run(mut self) -> EngineEventStats {
        debug!(target: "sfu.actor.engine_events", "EngineEventActor started");

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.engine_events",
                        "EngineEventActor received cancellation signal"
                    );
                    break;
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!(
                            target: "sfu.actor.engine_events",
                            "Engine event stream ended"
                        );
                        break;
                    };

                    self.mailbox.record_processed_with_backlog(self.events.len());
                    let keep_running = self.handle_event(event).await;

                    if !keep_running {
                        break;
                    }
                }
            }
        }

        let stats = EngineEventStats {
            events_processed: self.mailbox.messages_processed(),
            peak_backlog: self.mailbox.peak_depth(),
        };
        info!(
            target: "sfu.actor.engine_events",
            events_processed = stats.events_processed,
            peak_backlog = stats.peak_backlog,
            "EngineEventActor stopped"
        );
        stats
    }

    /// Returns `false` if the actor should stop.
    async fn handle_event(&self, event: EngineEvent) -> bool {
        sfu_metrics::record_engine_event(event.label());

        if let EngineEvent::WorkerDied { reason } = &event {
            error!(
                target: "sfu.actor.engine_events",
                reason = %reason,
                "Media engine worker died, signaling cannot continue"
            );
            self.fatal_token.cancel();
            return false;
        }

        debug!(
            target: "sfu.actor.engine_events",
            event = event.label(),
            "Engine event received"
        );
        self.coordinator.handle_engine_event(event).await;
        true
    }
}
