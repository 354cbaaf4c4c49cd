//! Domain events raised by entity transitions.
//!
//! Transitions never perform I/O. They hand events to a [`Dispatcher`], which
//! only records the intent; the request-scoped notifier publishes them once the
//! surrounding transaction has committed.

use strum::{AsRefStr, Display, EnumString};

/// Broadcast channel a readiness event travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum Channel {
    #[strum(serialize = "relaymq_task_ready")]
    TaskReady,
    #[strum(serialize = "relaymq_message_ready")]
    MessageReady,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::TaskReady, Channel::MessageReady];
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// At least one task of `kind` can be claimed.
    TaskReady { kind: String },
    /// At least one message in `queue` can be consumed.
    MessageReady { queue: String },
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Self::TaskReady { .. } => Channel::TaskReady,
            Self::MessageReady { .. } => Channel::MessageReady,
        }
    }

    /// The queue or kind name carried as the notification payload.
    pub fn subject(&self) -> &str {
        match self {
            Self::TaskReady { kind } => kind,
            Self::MessageReady { queue } => queue,
        }
    }
}

pub trait Dispatcher {
    fn dispatch(&mut self, event: Event);
}

impl Dispatcher for Vec<Event> {
    fn dispatch(&mut self, event: Event) {
        self.push(event);
    }
}
