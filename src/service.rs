use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    bus::{EventBus, PgDriver},
    clock::{Clock, SystemClock},
    config::Config,
    db::{PgStore, Store, Transaction},
    error::Error,
    notifier::ReadinessNotifier,
    queue::{QueueName, QueueRegistry},
};

pub mod jobs;
pub mod message;
pub mod task;

pub use jobs::Sweep;
pub use message::{AckItem, CreateMessage, NackItem, RedirectItem};
pub use task::{CreateTask, WorkError};

/// The use cases, shared by the HTTP handlers and the CLI jobs.
pub struct Service {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    queues: QueueRegistry,
    batch_size_limit: usize,
    max_poll: Duration,
    shutdown: CancellationToken,
}

#[bon::bon]
impl Service {
    #[builder]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        clock: Option<Arc<dyn Clock>>,
        queues: Option<QueueRegistry>,
        batch_size_limit: Option<usize>,
        max_poll: Option<Duration>,
        shutdown: Option<CancellationToken>,
    ) -> Self {
        Self {
            store,
            bus,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            queues: queues.unwrap_or_default(),
            batch_size_limit: batch_size_limit.unwrap_or(Config::default().batch_size_limit),
            max_poll: max_poll.unwrap_or_else(|| Config::default().max_poll()),
            shutdown: shutdown.unwrap_or_default(),
        }
    }

    /// Connects to PostgreSQL, runs migrations, and wires the LISTEN/NOTIFY bus.
    #[builder]
    pub async fn connect_with(
        config: Config,
        shutdown: Option<CancellationToken>,
    ) -> eyre::Result<Self> {
        let store = PgStore::connect(config.connect_options()?, config.max_connections).await?;

        store.migrate().await?;

        let bus = EventBus::new(PgDriver::new(store.pool().clone()));

        Ok(Self::builder()
            .store(Arc::new(store))
            .bus(Arc::new(bus))
            .queues(config.queues()?)
            .batch_size_limit(config.batch_size_limit)
            .max_poll(config.max_poll())
            .maybe_shutdown(shutdown)
            .build())
    }
}

impl Service {
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn batch_size_limit(&self) -> usize {
        self.batch_size_limit
    }

    pub fn max_poll(&self) -> Duration {
        self.max_poll
    }

    /// Cancelled when the process stops; pending long polls return early.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.store.ping().await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, Error> {
        self.store.begin().await
    }

    /// Commits, then publishes what the transaction made ready.
    async fn commit(
        &self,
        tx: Box<dyn Transaction>,
        notifier: ReadinessNotifier,
    ) -> Result<(), Error> {
        tx.commit().await?;
        notifier.flush(&self.bus).await;
        Ok(())
    }

    fn check_limit(&self, requested: usize) -> Result<(), Error> {
        if requested == 0 {
            return Err(Error::invalid_parameter("limit must be at least 1"));
        }

        if requested > self.batch_size_limit {
            return Err(Error::BatchSizeExceeded {
                requested,
                limit: self.batch_size_limit,
            });
        }

        Ok(())
    }

    fn check_poll(&self, poll: Duration) -> Result<(), Error> {
        if poll > self.max_poll {
            return Err(Error::invalid_parameter(format!(
                "poll must not exceed {} seconds",
                self.max_poll.as_secs_f64()
            )));
        }

        Ok(())
    }

    fn check_batch<T>(&self, items: &[T]) -> Result<(), Error> {
        if items.len() > self.batch_size_limit {
            return Err(Error::BatchSizeExceeded {
                requested: items.len(),
                limit: self.batch_size_limit,
            });
        }

        Ok(())
    }

    /// Parses a queue or kind name and checks it against the registry.
    fn queue_name(&self, name: &str) -> Result<QueueName, Error> {
        let queue = QueueName::parse(name)?;
        self.queues.get(&queue)?;
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::LocalDriver, db::MemoryStore};

    fn service(limit: usize) -> Service {
        Service::builder()
            .store(Arc::new(MemoryStore::new()))
            .bus(Arc::new(EventBus::new(LocalDriver::new())))
            .batch_size_limit(limit)
            .build()
    }

    #[test]
    fn test_limits_are_checked_before_io() {
        let service = service(10);

        assert!(service.check_limit(10).is_ok());
        assert!(matches!(
            service.check_limit(11),
            Err(Error::BatchSizeExceeded {
                requested: 11,
                limit: 10
            })
        ));
        assert!(matches!(
            service.check_limit(0),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(service.check_batch(&[0u8; 11]).is_err());
    }

    #[test]
    fn test_queue_names_are_validated() {
        let service = service(10);

        assert!(service.queue_name("orders.created").is_ok());
        assert!(service.queue_name("orders..created").is_err());
    }
}
