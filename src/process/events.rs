//! Fan-out of lifecycle events to any number of subscribers.
//!
//! Every subscriber owns an unbounded queue, so a slow consumer never makes
//! an instance wait and never loses events. Events from one slot are pushed
//! by a single task and therefore arrive in emission order; events from
//! different slots interleave freely.

use crate::process::types::LifecycleEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Multicast sender shared by the instances of one app
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<LifecycleEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber, dropping closed ones
    pub fn emit(&self, event: LifecycleEvent) {
        trace!(slot = event.slot, kind = %event.kind, "emitting lifecycle event");
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Register a subscriber; it observes events emitted from now on
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Lazy, unbounded sequence of events for one subscriber.
///
/// The stream ends once the bus and every clone of it are dropped.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event, without waiting
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::EventKind;

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(LifecycleEvent::new(0, EventKind::Started { pid: 42 }, ""));
        bus.emit(LifecycleEvent::new(0, EventKind::Stopped, "requested"));

        for stream in [&mut first, &mut second] {
            assert_eq!(
                stream.recv().await.unwrap().kind,
                EventKind::Started { pid: 42 }
            );
            assert_eq!(stream.recv().await.unwrap().kind, EventKind::Stopped);
            assert!(stream.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit(LifecycleEvent::new(0, EventKind::Starting, ""));

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());

        bus.emit(LifecycleEvent::new(1, EventKind::Stopping, ""));
        assert_eq!(late.recv().await.unwrap().slot, 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(LifecycleEvent::new(0, EventKind::Starting, ""));
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
