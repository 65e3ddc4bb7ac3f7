use tokio::sync::broadcast;

use super::aggregator::TableSource;

/// Phase of the generation currently being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Mutating,
    Rebuilding,
    Committed,
    RevertedOnFailure,
}

/// Progress notifications published by a session.
///
/// Delivery is best effort: events are dropped when nobody listens or a
/// receiver lags, and never influence the rebuild itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { generation: u64, state: SessionState },
    EntryExtracted { generation: u64, entry: usize, total: usize },
    Committed { generation: u64, source: TableSource, degraded: bool },
    Reverted { generation: u64, reason: String },
    Superseded { generation: u64, latest: u64 },
    /// A staged mutation was dropped before its rebuild committed
    Discarded { generation: u64 },
}

/// Sending side of the session event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub(crate) fn state(&self, generation: u64, state: SessionState) {
        self.emit(SessionEvent::StateChanged { generation, state });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::new(4);
        sink.state(1, SessionState::Mutating);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let sink = EventSink::new(4);
        let mut rx = sink.subscribe();
        sink.state(2, SessionState::Rebuilding);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StateChanged { generation: 2, state: SessionState::Rebuilding }
        );
    }
}
