//! Request-scoped buffer of readiness events.
//!
//! Transitions raise events while a transaction is open. The notifier keeps one event
//! per queue (or kind) and publishes them with [`ReadinessNotifier::flush`], which callers
//! invoke only after the transaction committed. Flushing earlier could wake a consumer
//! before the row it is looking for is visible.

use std::collections::HashSet;

use crate::{
    bus::EventBus,
    event::{Dispatcher, Event},
};

#[derive(Debug, Default)]
pub struct ReadinessNotifier {
    events: Vec<Event>,
    seen: HashSet<Event>,
}

impl ReadinessNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn pending(&self) -> &[Event] {
        &self.events
    }

    /// Publishes one notification per distinct event. Failures are logged, never returned.
    pub async fn flush(self, bus: &EventBus) {
        for event in self.events {
            if let Err(error) = bus.publish(event.channel(), event.subject()).await {
                tracing::warn!(%error, ?event, "Failed to publish readiness notification");
            }
        }
    }
}

impl Dispatcher for ReadinessNotifier {
    fn dispatch(&mut self, event: Event) {
        if self.seen.insert(event.clone()) {
            self.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_deduplicated_per_subject() {
        let mut notifier = ReadinessNotifier::new();

        for queue in ["a", "b", "a", "a"] {
            notifier.dispatch(Event::MessageReady {
                queue: queue.to_owned(),
            });
        }
        notifier.dispatch(Event::TaskReady {
            kind: "a".to_owned(),
        });

        assert_eq!(
            notifier.pending(),
            &[
                Event::MessageReady {
                    queue: "a".to_owned()
                },
                Event::MessageReady {
                    queue: "b".to_owned()
                },
                Event::TaskReady {
                    kind: "a".to_owned()
                },
            ]
        );
    }
}
