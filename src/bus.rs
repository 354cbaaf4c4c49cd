//! Cross-process readiness notifications.
//!
//! [`EventBus::publish`] hands a payload to the durable [`Driver`]. A single
//! [`EventBus::run`] loop keeps one listening connection open and fans every received
//! notification out to the in-process handlers registered with [`EventBus::subscribe`].
//!
//! Delivery is best effort. Notifications sent while the listener is reconnecting are
//! lost; waiters recover through their own poll deadline and safety tick.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, event::Channel};

pub mod local;
pub mod postgres;

pub use local::LocalDriver;
pub use postgres::PgDriver;

/// A listening attempt shorter than this is followed by [`RECONNECT_DELAY`].
pub const RECONNECT_GUARD: Duration = Duration::from_secs(60);

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub type Handler = Arc<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn publish(&self, channel: Channel, payload: &str) -> Result<(), Error>;

    /// Opens a listening connection subscribed to `channels`.
    async fn listen(&self, channels: &[Channel]) -> Result<Box<dyn Listener>, Error>;
}

#[async_trait]
pub trait Listener: Send {
    /// Waits for the next notification. An error means the connection is unusable.
    async fn recv(&mut self) -> Result<(Channel, String), Error>;
}

struct Entry {
    channel: Channel,
    handler: Handler,
}

type Subscriptions = papaya::HashMap<u64, Arc<Entry>>;

pub struct EventBus {
    driver: Arc<dyn Driver>,
    subscriptions: Arc<Subscriptions>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(driver: impl Driver) -> Self {
        Self {
            driver: Arc::new(driver),
            subscriptions: Arc::new(papaya::HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn publish(&self, channel: Channel, payload: &str) -> Result<(), Error> {
        self.driver.publish(channel, payload).await
    }

    /// Registers `handler` for `channel` until the returned [`Subscription`] is dropped.
    pub fn subscribe(&self, channel: Channel, handler: Handler) -> Subscription {
        // Wraps on overflow.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscriptions
            .pin()
            .insert(id, Arc::new(Entry { channel, handler }));

        Subscription {
            id,
            subscriptions: Arc::downgrade(&self.subscriptions),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.pin().len()
    }

    fn deliver(&self, channel: Channel, payload: &str) {
        let subscriptions = self.subscriptions.pin();

        for (_, entry) in subscriptions.iter().filter(|(_, e)| e.channel == channel) {
            let handler = entry.handler.clone();
            let payload = payload.to_owned();
            tokio::spawn(async move { handler(payload) });
        }
    }

    async fn listen_once(&self) -> Result<(), Error> {
        let mut listener = self.driver.listen(&Channel::ALL).await?;
        tracing::debug!("Listening for readiness notifications");

        loop {
            let (channel, payload) = listener.recv().await?;
            self.deliver(channel, &payload);
        }
    }

    /// Keeps one listening connection alive until `cancel` fires.
    ///
    /// A failed connection is rebuilt. If it lasted less than [`RECONNECT_GUARD`], the
    /// next attempt waits [`RECONNECT_DELAY`] first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            let started = Instant::now();

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.listen_once() => outcome,
            };

            if let Err(error) = outcome {
                tracing::warn!(%error, "Event bus listener failed, reconnecting");
            }

            if started.elapsed() < RECONNECT_GUARD {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

/// Removes its handler from the bus when dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscriptions: std::sync::Weak<Subscriptions>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            subscriptions.pin().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_handlers_receive_their_channel_only() {
        let bus = Arc::new(EventBus::new(LocalDriver::new()));
        let cancel = CancellationToken::new();

        let runner = tokio::spawn({
            let bus = bus.clone();
            let cancel = cancel.clone();
            async move { bus.run(cancel).await }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = bus.subscribe(
            Channel::MessageReady,
            Arc::new(move |payload: String| {
                let _ = tx.send(payload);
            }),
        );

        // The listener may not be attached yet; keep publishing until it is.
        let received = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                bus.publish(Channel::TaskReady, "ignored").await.unwrap();
                bus.publish(Channel::MessageReady, "orders").await.unwrap();

                tokio::select! {
                    payload = rx.recv() => break payload,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received.as_deref(), Some("orders"));

        cancel.cancel();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::new(LocalDriver::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let subscription = bus.subscribe(Channel::TaskReady, {
            let calls = calls.clone();
            Arc::new(move |_: String| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let other = bus.subscribe(Channel::TaskReady, Arc::new(|_: String| {}));

        assert_eq!(bus.subscriber_count(), 2);
        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_ids_are_unique() {
        let bus = EventBus::new(LocalDriver::new());

        let first = bus.subscribe(Channel::TaskReady, Arc::new(|_: String| {}));
        let second = bus.subscribe(Channel::TaskReady, Arc::new(|_: String| {}));

        assert_ne!(first.id, second.id);
    }

    /// Counts listening attempts. Every connection fails after `lifetime`.
    struct Flaky {
        listens: Arc<AtomicUsize>,
        lifetime: Duration,
    }

    struct FlakyListener {
        lifetime: Duration,
    }

    #[async_trait]
    impl Driver for Flaky {
        async fn publish(&self, _: Channel, _: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn listen(&self, _: &[Channel]) -> Result<Box<dyn Listener>, Error> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyListener {
                lifetime: self.lifetime,
            }))
        }
    }

    #[async_trait]
    impl Listener for FlakyListener {
        async fn recv(&mut self) -> Result<(Channel, String), Error> {
            tokio::time::sleep(self.lifetime).await;
            Err(Error::opaque())
        }
    }

    fn spawn_flaky(lifetime: Duration) -> (Arc<AtomicUsize>, CancellationToken) {
        let listens = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let bus = EventBus::new(Flaky {
            listens: listens.clone(),
            lifetime,
        });

        tokio::spawn({
            let cancel = cancel.clone();
            async move { bus.run(cancel).await }
        });

        (listens, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lived_connection_waits_before_reconnecting() {
        let (listens, cancel) = spawn_flaky(Duration::from_secs(1));

        // Failed at 1s, so the next attempt is due at 6s.
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(listens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(listens.load(Ordering::SeqCst), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_lived_connection_reconnects_immediately() {
        let lifetime = RECONNECT_GUARD + Duration::from_secs(1);
        let (listens, cancel) = spawn_flaky(lifetime);

        tokio::time::sleep(lifetime - Duration::from_millis(500)).await;
        assert_eq!(listens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(listens.load(Ordering::SeqCst), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel_while_backing_off() {
        struct Broken;

        #[async_trait]
        impl Driver for Broken {
            async fn publish(&self, _: Channel, _: &str) -> Result<(), Error> {
                Ok(())
            }

            async fn listen(&self, _: &[Channel]) -> Result<Box<dyn Listener>, Error> {
                Err(Error::opaque())
            }
        }

        let bus = EventBus::new(Broken);
        let cancel = CancellationToken::new();

        let runner = tokio::spawn({
            let cancel = cancel.clone();
            async move { bus.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();

        assert!(runner.await.unwrap().is_ok());
    }
}
