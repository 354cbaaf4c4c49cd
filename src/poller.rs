//! Consumer-side wait primitive for long polls.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::bus::Handler;

/// Upper bound on how long a waiter sleeps without re-checking, in case a
/// notification was lost.
pub const SAFETY_TICK: Duration = Duration::from_secs(3);

/// Deadline used when `now + poll` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct Poller {
    targets: Arc<HashSet<String>>,
    signal: Arc<Notify>,
    deadline: Instant,
}

impl Poller {
    pub fn new<I, S>(targets: I, poll: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: Arc::new(targets.into_iter().map(Into::into).collect()),
            signal: Arc::new(Notify::new()),
            deadline: deadline_after(poll),
        }
    }

    /// Wakes the waiter if `subject` is one of the targets. Repeated calls
    /// before the next wait collapse into one wakeup.
    pub fn handle_event(&self, subject: &str) {
        signal(&self.targets, &self.signal, subject);
    }

    /// A bus handler forwarding to [`Poller::handle_event`].
    pub fn handler(&self) -> Handler {
        let targets = self.targets.clone();
        let notify = self.signal.clone();

        Arc::new(move |subject: String| signal(&targets, &notify, &subject))
    }

    /// Returns on the first of: cancellation, the poll deadline, the safety tick, or a
    /// matching event.
    pub async fn wait_for_next_attempt(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = tokio::time::sleep(SAFETY_TICK) => {}
            _ = self.signal.notified() => {}
        }
    }

    pub fn is_timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

fn signal(targets: &HashSet<String>, notify: &Notify, subject: &str) {
    if targets.contains(subject) {
        notify.notify_one();
    }
}

fn deadline_after(poll: Duration) -> Instant {
    let now = Instant::now();

    now.checked_add(poll)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
