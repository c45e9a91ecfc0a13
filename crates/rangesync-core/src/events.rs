//! Pipeline events for external monitoring
//!
//! Both components can be handed a bounded sender. Emission never blocks:
//! when the channel is full the event is dropped with a warning, so a slow
//! consumer can't stall ingestion or reconciliation.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::model::{Cidr, Scope, SyncToken};

/// Events emitted by the `Ingestor` and `Reconciler`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Ingestion started for a notification
    IngestStarted {
        document_url: Option<String>,
    },

    /// Ingestion finished
    IngestCompleted {
        sync_token: SyncToken,
        written: usize,
        unchanged: usize,
        stale: bool,
    },

    /// Reconciliation started for a scope
    ReconcileStarted {
        scope: Scope,
    },

    /// A rule was added to the boundary
    RuleAdded {
        scope: Scope,
        cidr: Cidr,
    },

    /// A rule was removed from the boundary
    RuleRemoved {
        scope: Scope,
        cidr: Cidr,
    },

    /// A single rule change failed and was skipped
    RuleFailed {
        scope: Scope,
        cidr: Cidr,
        error: String,
    },

    /// Reconciliation finished for a scope
    ReconcileCompleted {
        scope: Scope,
        added: usize,
        removed: usize,
        failed: usize,
    },
}

/// Non-blocking sender half handed to the components
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SyncEvent>>,
}

impl EventSink {
    /// Create a sink and the stream of events it feeds
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, ReceiverStream::new(rx))
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
            warn!(
                "Event channel full, dropping event. Consider increasing event_channel_capacity."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (sink, stream) = EventSink::channel(8);
        let scope = Scope::new("us-west-2", "EC2");

        sink.emit(SyncEvent::ReconcileStarted {
            scope: scope.clone(),
        });
        sink.emit(SyncEvent::ReconcileCompleted {
            scope: scope.clone(),
            added: 1,
            removed: 0,
            failed: 0,
        });
        drop(sink);

        let events: Vec<SyncEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SyncEvent::ReconcileStarted { scope });
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (sink, stream) = EventSink::channel(1);
        let scope = Scope::new("us-west-2", "EC2");

        for _ in 0..5 {
            sink.emit(SyncEvent::ReconcileStarted {
                scope: scope.clone(),
            });
        }
        drop(sink);

        let events: Vec<SyncEvent> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        EventSink::disabled().emit(SyncEvent::IngestStarted { document_url: None });
    }
}
