//! Broadcast fan-out of run events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// A run of a few hundred jobs emits well under this many events between two
/// receiver polls; slower observers see `Lagged` rather than blocking jobs.
const DEFAULT_CAPACITY: usize = 1000;

/// Cheap to clone; every clone publishes into the same channel and shares
/// one sequence counter.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap `event` in a fresh envelope and publish it.
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Stamp `envelope` with the next sequence number and hand it to every
    /// current receiver. Returns how many received it; with no receivers the
    /// event is counted but otherwise discarded.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sender.send(envelope.with_seq(seq)).unwrap_or(0)
    }

    /// Receivers only see events published after they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published so far, delivered or not.
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.event_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(job: &str) -> Event {
        Event::JobQueued {
            job_id: job.to_string(),
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_every_receiver_with_seq() {
        let bus = EventBus::new();
        let mut progress = bus.subscribe();
        let mut log = bus.subscribe();

        assert_eq!(bus.emit(queued("p1")), 2);

        let a = progress.recv().await.unwrap();
        let b = log.recv().await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.seq, 1);
        assert_eq!(a.event.job_id(), Some("p1"));
    }

    #[tokio::test]
    async fn test_publish_overrides_envelope_seq() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(queued("p0"));

        let envelope = EventEnvelope::new(queued("p1")).with_seq(99);
        bus.publish(envelope.clone());

        rx.recv().await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.seq, 2);
    }

    #[test]
    fn test_unobserved_events_are_still_counted() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(queued("p1")), 0);
        assert_eq!(bus.emit(queued("p2")), 0);
        assert_eq!(bus.event_count(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_sequence_and_receivers() {
        let bus = EventBus::new();
        let worker_side = bus.clone();
        let mut rx = bus.subscribe();
        assert_eq!(worker_side.subscriber_count(), 1);

        bus.emit(queued("p1"));
        worker_side.emit(Event::AttemptStarted {
            job_id: "p1".to_string(),
            attempt: 1,
        });
        bus.emit(Event::JobSucceeded {
            job_id: "p1".to_string(),
            attempts: 1,
        });

        let mut seqs = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            seqs.push(envelope.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(worker_side.event_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_receiver_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            bus.emit(queued(&format!("p{}", i)));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().seq, 3);
    }
}
